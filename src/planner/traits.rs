//! Planner/controller contracts.

use crate::error::ControllerFault;
use crate::geometry::Pose;
use crate::scene::traits::RobotSpec;
use crate::task::Task;
use crate::trajectory::types::SceneState;

/// A joint-space trajectory with a tracking cursor.
///
/// Once every waypoint has been handed out the last one is held.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTrajectory {
    waypoints: Vec<Vec<f64>>,
    cursor: usize,
}

impl PlannedTrajectory {
    pub fn new(waypoints: Vec<Vec<f64>>) -> Result<Self, ControllerFault> {
        if waypoints.is_empty() {
            return Err(ControllerFault::EmptyPlan);
        }
        Ok(Self { waypoints, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn waypoints(&self) -> &[Vec<f64>] {
        &self.waypoints
    }

    /// Number of waypoints handed out so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.waypoints.len()
    }

    /// The waypoint most recently handed out.
    pub fn previous_target(&self) -> Option<&[f64]> {
        self.cursor.checked_sub(1).map(|i| self.waypoints[i].as_slice())
    }

    /// Hand out the next waypoint.
    pub fn advance(&mut self) -> &[f64] {
        let i = self.cursor.min(self.waypoints.len() - 1);
        if self.cursor < self.waypoints.len() {
            self.cursor += 1;
        }
        &self.waypoints[i]
    }
}

/// Produces a plan once per episode and turns it into per-step actions.
pub trait MotionPlanner: Send {
    fn plan(&mut self, task: &Task, state: &SceneState) -> Result<PlannedTrajectory, ControllerFault>;

    /// Next joint-target action given the current state.
    ///
    /// Fails with [`ControllerFault::TrackingDiverged`] when the robot did not
    /// follow the previous target.
    fn track(
        &mut self,
        state: &SceneState,
        trajectory: &mut PlannedTrajectory,
    ) -> Result<Vec<f64>, ControllerFault>;
}

/// Maps a tool pose plus per-finger opening to a joint vector.
pub trait InverseKinematics: Send + Sync {
    fn solve(&self, tool: &Pose, finger: f64, robot: &RobotSpec) -> Result<Vec<f64>, ControllerFault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_plans_are_rejected() {
        assert_eq!(PlannedTrajectory::new(Vec::new()), Err(ControllerFault::EmptyPlan));
    }

    #[test]
    fn advance_holds_the_last_waypoint() {
        let mut plan = PlannedTrajectory::new(vec![vec![1.0], vec![2.0]]).unwrap();
        assert_eq!(plan.previous_target(), None);
        assert_eq!(plan.advance(), &[1.0]);
        assert_eq!(plan.advance(), &[2.0]);
        assert!(plan.is_finished());
        assert_eq!(plan.advance(), &[2.0]);
        assert_eq!(plan.previous_target(), Some(&[2.0][..]));
        assert_eq!(plan.cursor(), 2);
    }
}
