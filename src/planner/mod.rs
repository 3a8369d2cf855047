//! Motion planning and joint-target tracking.

pub mod interpolate;
pub mod traits;

pub use interpolate::{GantryIk, InterpolatingPlanner};
pub use traits::{InverseKinematics, MotionPlanner, PlannedTrajectory};
