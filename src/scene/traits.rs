//! The simulation engine contract and the types that cross it.
//!
//! Physics and rendering are external collaborators. The scene controller
//! drives any engine that implements [`SimEngine`]; the crate ships
//! [`KinematicSim`](super::kinematic::KinematicSim) as a deterministic
//! reference implementation.

use serde::{Deserialize, Serialize};

use crate::array::NdArray;
use crate::error::EngineError;
use crate::geometry::Pose;

use super::layout::{ObjectSpec, SupportSurface};

// ---------------------------------------------------------------------------
// Robot description
// ---------------------------------------------------------------------------

/// Joint layout and safety limits of the robot.
///
/// The last `finger_joints` entries are gripper fingers; their sum is the
/// gripper opening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotSpec {
    pub joint_names: Vec<String>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// Canonical pose the robot is reset to.
    pub home: Vec<f64>,
    /// Largest per-tick change of any joint target.
    pub max_joint_delta: f64,
    pub finger_joints: usize,
}

impl RobotSpec {
    pub fn joint_count(&self) -> usize {
        self.joint_names.len()
    }

    /// Index of the first finger joint.
    pub fn first_finger(&self) -> usize {
        self.joint_count().saturating_sub(self.finger_joints)
    }

    pub fn validate(&self) -> Result<(), String> {
        let n = self.joint_count();
        if n == 0 {
            return Err("robot has no joints".into());
        }
        if self.lower.len() != n || self.upper.len() != n || self.home.len() != n {
            return Err(format!(
                "limit/home vectors must have {n} entries (lower={}, upper={}, home={})",
                self.lower.len(),
                self.upper.len(),
                self.home.len()
            ));
        }
        if self.finger_joints > n {
            return Err("more finger joints than joints".into());
        }
        for i in 0..n {
            if !(self.lower[i] <= self.upper[i]) {
                return Err(format!("joint `{}` has lower > upper", self.joint_names[i]));
            }
            if self.home[i] < self.lower[i] || self.home[i] > self.upper[i] {
                return Err(format!("home of joint `{}` is outside its limits", self.joint_names[i]));
            }
        }
        if !(self.max_joint_delta > 0.0) {
            return Err("max_joint_delta must be > 0".into());
        }
        Ok(())
    }
}

impl Default for RobotSpec {
    /// Nine-joint Cartesian gantry: three prismatic axes carrying the tool
    /// centre point, a four-joint wrist and two prismatic fingers.
    fn default() -> Self {
        use std::f64::consts::PI;
        let joint_names = [
            "gantry_x",
            "gantry_y",
            "gantry_z",
            "wrist_roll",
            "wrist_pitch",
            "wrist_yaw",
            "wrist_flange",
            "finger_left",
            "finger_right",
        ];
        Self {
            joint_names: joint_names.iter().map(|s| s.to_string()).collect(),
            lower: vec![0.15, -0.5, 0.0, -PI, -PI, -PI, -PI, 0.0, 0.0],
            upper: vec![0.85, 0.5, 0.5, PI, PI, PI, PI, 0.05, 0.05],
            home: vec![0.45, 0.0, 0.3, 0.0, 0.0, 0.0, 0.0, 0.05, 0.05],
            max_joint_delta: 0.05,
            finger_joints: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Cameras and lighting
// ---------------------------------------------------------------------------

/// A pinhole camera. Used both as configuration (nominal pose) and, after
/// per-episode randomization, as the pose handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSpec {
    pub name: String,
    pub width: usize,
    pub height: usize,
    /// Vertical field of view in degrees.
    pub fov_deg: f64,
    pub position: [f64; 3],
    pub look_at: [f64; 3],
}

impl CameraSpec {
    /// Shape of a frame from this camera: `(height, width, 3)`.
    pub fn frame_shape(&self) -> Vec<usize> {
        vec![self.height, self.width, 3]
    }
}

impl Default for CameraSpec {
    fn default() -> Self {
        Self {
            name: "front".into(),
            width: 640,
            height: 480,
            fov_deg: 60.0,
            position: [1.0, 0.0, 0.8],
            look_at: [0.5, 0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lighting {
    pub position: [f64; 3],
    pub intensity: f64,
}

impl Default for Lighting {
    fn default() -> Self {
        Self {
            position: [1.5, 0.0, 2.5],
            intensity: 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// World setup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedObject {
    pub spec: ObjectSpec,
    pub pose: Pose,
}

/// Everything the engine needs to rebuild the world for a new episode.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSetup {
    pub robot_joints: Vec<f64>,
    pub objects: Vec<PlacedObject>,
    pub supports: Vec<SupportSurface>,
    pub lighting: Lighting,
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// The physics/rendering engine.
///
/// Implementations own all simulation state. Steps are blocking and a single
/// instance is driven by one worker at a time (`&mut self`). Engines are
/// assumed deterministic given the same setup and target sequence.
pub trait SimEngine: Send {
    /// Discard the current world and build the one described by `setup`.
    fn reset(&mut self, setup: &WorldSetup) -> Result<(), EngineError>;

    /// Command joint position targets and advance one control tick.
    fn step(&mut self, joint_targets: &[f64]) -> Result<(), EngineError>;

    /// Render an RGB frame of shape `(height, width, 3)`, dtype `uint8`.
    fn render(&self, camera: &CameraSpec) -> Result<NdArray, EngineError>;

    fn joint_positions(&self) -> Vec<f64>;

    fn end_effector_pose(&self) -> Pose;

    fn object_pose(&self, id: &str) -> Option<Pose>;

    /// Id of the object currently held in the gripper, if any.
    fn held_object(&self) -> Option<String>;

    /// Whether any part of the robot touches the object.
    fn in_contact(&self, id: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_robot_is_valid() {
        let robot = RobotSpec::default();
        assert!(robot.validate().is_ok());
        assert_eq!(robot.joint_count(), 9);
        assert_eq!(robot.first_finger(), 7);
    }

    #[test]
    fn robot_validation_catches_bad_home() {
        let mut robot = RobotSpec::default();
        robot.home[0] = 2.0;
        assert!(robot.validate().unwrap_err().contains("gantry_x"));
    }

    #[test]
    fn camera_frame_shape_is_hwc() {
        let cam = CameraSpec {
            width: 128,
            height: 96,
            ..CameraSpec::default()
        };
        assert_eq!(cam.frame_shape(), vec![96, 128, 3]);
    }
}
