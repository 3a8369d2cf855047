//! Keyframe planner with linear joint-space interpolation.
//!
//! Each task kind expands into a short list of tool keyframes (hover,
//! descend, close, carry, ...). Keyframes are solved with an
//! [`InverseKinematics`] implementation and joined by straight lines in joint
//! space.

use nalgebra::Vector3;

use crate::config::{PlannerConfig, SynthesisConfig};
use crate::error::ControllerFault;
use crate::geometry::{pose_at, Pose};
use crate::scene::kinematic::PUSHER_RADIUS;
use crate::scene::layout::ObjectSpec;
use crate::scene::traits::RobotSpec;
use crate::task::{Task, TaskKind};
use crate::trajectory::types::SceneState;

use super::traits::{InverseKinematics, MotionPlanner, PlannedTrajectory};

// ---------------------------------------------------------------------------
// Gantry IK
// ---------------------------------------------------------------------------

/// Closed-form IK for the Cartesian gantry: position on joints 0..3, tool
/// yaw on joint 5, the remaining wrist joints at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct GantryIk;

impl InverseKinematics for GantryIk {
    fn solve(&self, tool: &Pose, finger: f64, robot: &RobotSpec) -> Result<Vec<f64>, ControllerFault> {
        let first_finger = robot.first_finger();
        if first_finger < 6 {
            return Err(ControllerFault::Unreachable(format!(
                "gantry IK needs at least 6 arm joints, robot has {first_finger}"
            )));
        }
        let t = tool.translation;
        let (_, _, yaw) = tool.rotation.euler_angles();
        let mut q = vec![0.0; robot.joint_count()];
        q[0] = t.x;
        q[1] = t.y;
        q[2] = t.z;
        q[5] = yaw;
        for f in &mut q[first_finger..] {
            *f = finger;
        }
        for (i, v) in q.iter().enumerate() {
            if *v < robot.lower[i] - 1e-9 || *v > robot.upper[i] + 1e-9 {
                return Err(ControllerFault::Unreachable(format!(
                    "{} = {v:.3} outside [{:.3}, {:.3}]",
                    robot.joint_names[i], robot.lower[i], robot.upper[i]
                )));
            }
        }
        Ok(q)
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Keyframe {
    tool: Pose,
    finger: f64,
    steps: usize,
}

#[derive(Debug, Clone)]
pub struct InterpolatingPlanner<K: InverseKinematics = GantryIk> {
    config: PlannerConfig,
    robot: RobotSpec,
    objects: Vec<ObjectSpec>,
    ik: K,
}

impl InterpolatingPlanner<GantryIk> {
    /// Planner for the reference gantry described by `config`.
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self::new(
            config.planner.clone(),
            config.scene.robot.clone(),
            config.scene.layout.objects.clone(),
            GantryIk,
        )
    }
}

impl<K: InverseKinematics> InterpolatingPlanner<K> {
    pub fn new(config: PlannerConfig, robot: RobotSpec, objects: Vec<ObjectSpec>, ik: K) -> Self {
        Self {
            config,
            robot,
            objects,
            ik,
        }
    }

    fn keyframes(&self, task: &Task, object: &Vector3<f64>, spec: &ObjectSpec) -> Vec<Keyframe> {
        let c = &self.config;
        let goal = task.goal_pose().translation.vector;
        let arm = |x: f64, y: f64, z: f64, finger: f64| Keyframe {
            tool: pose_at(x, y, z),
            finger,
            steps: c.segment_steps,
        };
        let gripper = |x: f64, y: f64, z: f64, finger: f64| Keyframe {
            tool: pose_at(x, y, z),
            finger,
            steps: c.gripper_steps,
        };
        let (open, closed) = (c.gripper_open, c.gripper_closed);
        let o = object;

        match task.kind() {
            TaskKind::Pick => vec![
                arm(o.x, o.y, o.z + c.approach_height, open),
                arm(o.x, o.y, o.z, open),
                gripper(o.x, o.y, o.z, closed),
                arm(goal.x, goal.y, goal.z, closed),
            ],
            TaskKind::PickAndPlace => {
                let carry = o.z.max(goal.z) + c.approach_height;
                vec![
                    arm(o.x, o.y, o.z + c.approach_height, open),
                    arm(o.x, o.y, o.z, open),
                    gripper(o.x, o.y, o.z, closed),
                    arm(o.x, o.y, carry, closed),
                    arm(goal.x, goal.y, carry, closed),
                    arm(goal.x, goal.y, goal.z, closed),
                    gripper(goal.x, goal.y, goal.z, open),
                    arm(goal.x, goal.y, goal.z + c.approach_height, open),
                ]
            }
            TaskKind::Push => {
                let dir = match task.direction() {
                    Some(d) => {
                        let [x, y] = d.unit();
                        Vector3::new(x, y, 0.0)
                    }
                    None => Vector3::new(goal.x - o.x, goal.y - o.y, 0.0)
                        .try_normalize(1e-9)
                        .unwrap_or_else(Vector3::x),
                };
                let contact = spec.shape.footprint_radius() + PUSHER_RADIUS;
                let start = o - dir * (contact + c.push_standoff);
                let end = goal - dir * contact;
                vec![
                    arm(start.x, start.y, o.z + c.approach_height, closed),
                    arm(start.x, start.y, o.z, closed),
                    arm(end.x, end.y, o.z, closed),
                    arm(end.x, end.y, o.z + c.approach_height, closed),
                ]
            }
        }
    }
}

impl<K: InverseKinematics> MotionPlanner for InterpolatingPlanner<K> {
    fn plan(&mut self, task: &Task, state: &SceneState) -> Result<PlannedTrajectory, ControllerFault> {
        let id = task.target_object_id();
        let object = state
            .object_pose(id)
            .ok_or_else(|| ControllerFault::Unreachable(format!("`{id}` is not in the scene")))?
            .translation
            .vector;
        let spec = self
            .objects
            .iter()
            .find(|o| o.id == id)
            .ok_or_else(|| ControllerFault::Unreachable(format!("no description for `{id}`")))?;

        let mut from = state.robot_joint_positions().to_vec();
        let mut waypoints = Vec::new();
        for keyframe in self.keyframes(task, &object, spec) {
            let to = self.ik.solve(&keyframe.tool, keyframe.finger, &self.robot)?;
            for s in 1..=keyframe.steps {
                let a = s as f64 / keyframe.steps as f64;
                waypoints.push(from.iter().zip(&to).map(|(p, q)| p + (q - p) * a).collect());
            }
            from = to;
        }
        tracing::debug!(kind = %task.kind(), waypoints = waypoints.len(), "planned trajectory");
        PlannedTrajectory::new(waypoints)
    }

    fn track(
        &mut self,
        state: &SceneState,
        trajectory: &mut PlannedTrajectory,
    ) -> Result<Vec<f64>, ControllerFault> {
        if let Some(previous) = trajectory.previous_target() {
            // Fingers stall on grasped objects; only arm joints are tracked.
            let arm = self.robot.first_finger();
            let error = state
                .robot_joint_positions()
                .iter()
                .zip(previous)
                .take(arm)
                .map(|(q, t)| (q - t).abs())
                .fold(0.0, f64::max);
            if error > self.config.tracking_tolerance {
                return Err(ControllerFault::TrackingDiverged {
                    waypoint: trajectory.cursor() - 1,
                    error,
                    tolerance: self.config.tracking_tolerance,
                });
            }
        }
        Ok(trajectory.advance().to_vec())
    }
}
