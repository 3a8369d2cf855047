//! Core trajectory data types recorded for every episode.
//!
//! A step pairs the [`Observation`] captured *before* an action with the
//! [`ActionRecord`] describing that action, so `(observation_t, action_t)` is
//! exactly what a policy sees and does.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::array::NdArray;
use crate::error::ArchiveError;
use crate::geometry::Pose;
use crate::task::Task;

// ---------------------------------------------------------------------------
// Scene state snapshot
// ---------------------------------------------------------------------------

/// Read-only snapshot of the simulated world after a reset or a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneState {
    robot_joint_positions: Vec<f64>,
    object_poses: BTreeMap<String, Pose>,
    end_effector: Pose,
    held_object: Option<String>,
    /// Monotonic step index; 0 right after reset.
    timestamp: u64,
}

impl SceneState {
    pub(crate) fn new(
        robot_joint_positions: Vec<f64>,
        object_poses: BTreeMap<String, Pose>,
        end_effector: Pose,
        held_object: Option<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            robot_joint_positions,
            object_poses,
            end_effector,
            held_object,
            timestamp,
        }
    }

    pub fn robot_joint_positions(&self) -> &[f64] {
        &self.robot_joint_positions
    }

    pub fn object_poses(&self) -> &BTreeMap<String, Pose> {
        &self.object_poses
    }

    pub fn object_pose(&self, id: &str) -> Option<&Pose> {
        self.object_poses.get(id)
    }

    pub fn end_effector(&self) -> &Pose {
        &self.end_effector
    }

    pub fn held_object(&self) -> Option<&str> {
        self.held_object.as_deref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Largest absolute difference in joints or object translations.
    ///
    /// Returns `f64::INFINITY` when the two states track different objects
    /// or joint counts.
    pub fn max_deviation(&self, other: &SceneState) -> f64 {
        if self.robot_joint_positions.len() != other.robot_joint_positions.len()
            || !self.object_poses.keys().eq(other.object_poses.keys())
            || self.held_object != other.held_object
        {
            return f64::INFINITY;
        }
        let joints = self
            .robot_joint_positions
            .iter()
            .zip(&other.robot_joint_positions)
            .map(|(a, b)| (a - b).abs());
        let objects = self
            .object_poses
            .values()
            .zip(other.object_poses.values())
            .map(|(a, b)| (a.translation.vector - b.translation.vector).amax());
        joints.chain(objects).fold(0.0, f64::max)
    }
}

// ---------------------------------------------------------------------------
// Per-step records
// ---------------------------------------------------------------------------

/// Sensor readings captured before the step's action is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub step_index: usize,
    /// Camera name -> `(H, W, 3)` `uint8` frame.
    pub camera_images: BTreeMap<String, NdArray>,
    pub proprioception: Vec<f64>,
    /// The scene state the readings were derived from.
    pub state: SceneState,
}

/// What was commanded, what the robot actually received after safety
/// clipping, and the sparse reward for the resulting transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step_index: usize,
    pub commanded_action: Vec<f64>,
    pub executed_action: Vec<f64>,
    pub reward: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub observation: Observation,
    pub action: ActionRecord,
}

// ---------------------------------------------------------------------------
// Outcome and header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
    Timeout,
    /// Never archived; reported to the caller only.
    Aborted,
}

impl Outcome {
    pub const ALL: [Outcome; 4] = [Self::Succeeded, Self::Failed, Self::Timeout, Self::Aborted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Episode metadata. Built once at finalize; there are no setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeHeader {
    task: Task,
    outcome: Outcome,
    length: usize,
    /// Seed the run asked for; `task.seed()` is the attempt seed actually used.
    source_seed: u64,
    attempt: u32,
    failure_reason: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl EpisodeHeader {
    pub(crate) fn finalize(
        task: Task,
        outcome: Outcome,
        length: usize,
        source_seed: u64,
        attempt: u32,
        failure_reason: Option<String>,
    ) -> Self {
        Self {
            task,
            outcome,
            length,
            source_seed,
            attempt,
            failure_reason,
            recorded_at: Utc::now(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn seed(&self) -> u64 {
        self.task.seed()
    }

    pub fn source_seed(&self) -> u64 {
        self.source_seed
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

// ---------------------------------------------------------------------------
// Episode
// ---------------------------------------------------------------------------

/// A finalized episode: header plus exactly `header.length()` steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    header: EpisodeHeader,
    steps: Vec<StepRecord>,
}

impl Episode {
    pub fn new(header: EpisodeHeader, steps: Vec<StepRecord>) -> Result<Self, ArchiveError> {
        if header.length != steps.len() {
            return Err(ArchiveError::LengthMismatch {
                header: header.length,
                steps: steps.len(),
            });
        }
        if header.outcome == Outcome::Aborted {
            return Err(ArchiveError::Corrupt("aborted episodes cannot be finalized".into()));
        }
        Ok(Self { header, steps })
    }

    pub fn header(&self) -> &EpisodeHeader {
        &self.header
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn total_reward(&self) -> f32 {
        self.steps.iter().map(|s| s.action.reward).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_task, synthetic_steps};

    #[test]
    fn episode_length_must_match_header() {
        let task = sample_task(3);
        let steps = synthetic_steps(4, 9, 8);
        let header = EpisodeHeader::finalize(task.clone(), Outcome::Timeout, 4, 3, 0, None);
        let episode = Episode::new(header, steps.clone()).unwrap();
        assert_eq!(episode.len(), 4);
        assert_eq!(episode.header().seed(), task.seed());

        let header = EpisodeHeader::finalize(task, Outcome::Timeout, 5, 3, 0, None);
        let err = Episode::new(header, steps).unwrap_err();
        assert!(matches!(err, ArchiveError::LengthMismatch { header: 5, steps: 4 }));
    }

    #[test]
    fn aborted_episodes_cannot_be_built() {
        let header = EpisodeHeader::finalize(sample_task(0), Outcome::Aborted, 0, 0, 0, None);
        assert!(Episode::new(header, Vec::new()).is_err());
    }

    #[test]
    fn deviation_is_infinite_for_different_layouts() {
        let steps = synthetic_steps(2, 9, 8);
        let a = &steps[0].observation.state;
        let b = &steps[1].observation.state;
        assert!(a.max_deviation(a) == 0.0);
        assert!(a.max_deviation(b).is_finite());

        let shorter = SceneState::new(vec![0.0; 3], a.object_poses().clone(), *a.end_effector(), None, 0);
        assert_eq!(a.max_deviation(&shorter), f64::INFINITY);
    }

    #[test]
    fn outcome_names_are_lowercase() {
        assert_eq!(serde_json::to_string(&Outcome::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(Outcome::Succeeded.to_string(), "succeeded");
    }
}
