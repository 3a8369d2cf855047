//! Simulated scene: static layout, the engine contract, the controller that
//! drives an engine, and the kinematic reference engine.

pub mod controller;
pub mod kinematic;
pub mod layout;
pub mod traits;

pub use controller::SceneController;
pub use kinematic::KinematicSim;
pub use layout::{ObjectSpec, SceneGeometry, SceneLayout, SupportSurface};
pub use traits::{CameraSpec, Lighting, RobotSpec, SimEngine, WorldSetup};
