//! Trajectory types and the per-episode step recorder.
//!
//! - [`types::SceneState`], [`types::Observation`], [`types::ActionRecord`] --
//!   what is captured at every step.
//! - [`types::EpisodeHeader`], [`types::Episode`] -- a finalized episode.
//! - [`recorder::TrajectoryRecorder`] -- buffers steps and commits them to
//!   the archive at episode end.

pub mod recorder;
pub mod types;

pub use recorder::TrajectoryRecorder;
pub use types::{ActionRecord, Episode, EpisodeHeader, Observation, Outcome, SceneState, StepRecord};
