//! Error taxonomy for the synthesis pipeline.
//!
//! Each stage owns its error type. The propagation policy is encoded in how
//! the orchestrator consumes them:
//!
//! | Error                           | Raised by     | Effect                                  |
//! |---------------------------------|---------------|-----------------------------------------|
//! | [`SamplingError::InfeasibleTask`] | task sampler | resampled with a derived seed (bounded) |
//! | [`SceneError::Infeasible`]      | scene reset   | attempt aborted, nothing recorded        |
//! | [`ControllerFault`]             | planner       | episode recorded as `Failed`             |
//! | [`ExecutionFault::TimeoutExceeded`] | orchestrator | episode recorded as `Timeout`        |
//! | [`ArchiveError`]                | archive       | surfaced to the caller after cleanup     |

use std::path::PathBuf;

use thiserror::Error;

use crate::orchestrator::state::EpisodePhase;
use crate::trajectory::types::Outcome;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Task sampling errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplingError {
    /// No object/goal satisfies the sampled task kind. Retryable with a new seed.
    #[error("infeasible {kind} task: {reason}")]
    InfeasibleTask { kind: String, reason: String },

    /// The configured weights cannot form a distribution. Not retryable.
    #[error("invalid sampling weights: {0}")]
    InvalidWeights(String),
}

impl SamplingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InfeasibleTask { .. })
    }
}

/// Failures reported by a [`SimEngine`](crate::scene::SimEngine) implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("engine reset failed: {0}")]
    Reset(String),

    #[error("engine step failed: {0}")]
    Step(String),

    #[error("render failed: {0}")]
    Render(String),
}

/// Scene controller errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SceneError {
    /// No collision-free, task-consistent initial state could be built.
    #[error("scene infeasible: {0}")]
    Infeasible(String),

    #[error("unknown camera: {0}")]
    UnknownCamera(String),

    #[error("action dimension mismatch: expected {expected}, got {got}")]
    ActionDimension { expected: usize, got: usize },

    #[error("action contains a non-finite value at joint {0}")]
    NonFiniteAction(usize),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Unrecoverable planner/controller failures during execution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControllerFault {
    #[error("target unreachable: {0}")]
    Unreachable(String),

    #[error("tracking diverged at waypoint {waypoint}: joint error {error:.4} exceeds {tolerance:.4}")]
    TrackingDiverged {
        waypoint: usize,
        error: f64,
        tolerance: f64,
    },

    #[error("planner produced an empty trajectory")]
    EmptyPlan,
}

/// Execution-time faults. Each one ends the episode with a recorded outcome.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionFault {
    #[error(transparent)]
    Controller(#[from] ControllerFault),

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error("step budget of {max_steps} exhausted")]
    TimeoutExceeded { max_steps: usize },
}

impl ExecutionFault {
    /// Outcome recorded for an episode that ended with this fault.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Controller(_) | Self::Scene(_) => Outcome::Failed,
            Self::TimeoutExceeded { .. } => Outcome::Timeout,
        }
    }
}

/// Trajectory recorder errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecorderError {
    #[error("misaligned step: buffer holds {expected} steps but observation is {observation} and action is {action}")]
    Misaligned {
        expected: usize,
        observation: usize,
        action: usize,
    },

    #[error("shape mismatch in {stream}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        stream: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

/// Archive read/write errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("episode encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not an episode file (bad magic {0:?})")]
    BadMagic([u8; 4]),

    #[error("unsupported episode format version {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt episode data: {0}")]
    Corrupt(String),

    #[error("header length {header} does not match {steps} buffered steps")]
    LengthMismatch { header: usize, steps: usize },

    #[error("episode {0} not found")]
    NotFound(u64),

    #[error("dataset at {path} is incompatible: {reason}")]
    IncompatibleDataset { path: PathBuf, reason: String },

    #[error("archive at {0} was opened read-only")]
    ReadOnly(PathBuf),
}

/// A lifecycle transition the episode state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal episode transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: EpisodePhase,
    pub to: EpisodePhase,
}

/// Failure to produce an episode for a requested seed.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no feasible task for seed {seed} after {attempts} samples: {last}")]
    TaskInfeasible {
        seed: u64,
        attempts: u32,
        last: SamplingError,
    },

    #[error("scene reset infeasible for seed {seed} on all {attempts} attempts: {last}")]
    SceneInfeasible {
        seed: u64,
        attempts: u32,
        last: SceneError,
    },

    #[error(transparent)]
    Sampling(SamplingError),

    #[error(transparent)]
    Lifecycle(#[from] IllegalTransition),

    #[error(transparent)]
    Scene(SceneError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}
