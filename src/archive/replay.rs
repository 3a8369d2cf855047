//! Deterministic replay check for archived episodes.
//!
//! Resets a scene from the recorded task, feeds the recorded commanded
//! actions back in and compares what comes out against the archive.

use serde::Serialize;

use crate::error::SceneError;
use crate::scene::{SceneController, SimEngine};
use crate::trajectory::types::Episode;

/// Where a replay first disagreed with the recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Divergence {
    pub step: usize,
    /// `"scene state"` or `"executed action"`.
    pub stream: &'static str,
    pub deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub steps_checked: usize,
    pub max_deviation: f64,
    pub divergence: Option<Divergence>,
}

impl ReplayReport {
    pub fn is_deterministic(&self) -> bool {
        self.divergence.is_none()
    }
}

fn action_deviation(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

/// Replay `episode` on `scene` and stop at the first deviation above
/// `tolerance`.
///
/// The scene must be configured like the one that recorded the episode.
pub fn verify_replay<E: SimEngine>(
    episode: &Episode,
    scene: &mut SceneController<E>,
    tolerance: f64,
) -> Result<ReplayReport, SceneError> {
    let mut report = ReplayReport {
        steps_checked: 0,
        max_deviation: 0.0,
        divergence: None,
    };
    let mut state = scene.reset(episode.header().task())?;

    for (step, record) in episode.steps().iter().enumerate() {
        let deviation = state.max_deviation(&record.observation.state);
        report.max_deviation = report.max_deviation.max(deviation);
        if deviation > tolerance {
            report.divergence = Some(Divergence {
                step,
                stream: "scene state",
                deviation,
            });
            break;
        }

        let (next, executed) = scene.step(&record.action.commanded_action)?;
        let deviation = action_deviation(&executed, &record.action.executed_action);
        report.max_deviation = report.max_deviation.max(deviation);
        if deviation > tolerance {
            report.divergence = Some(Divergence {
                step,
                stream: "executed action",
                deviation,
            });
            break;
        }
        state = next;
        report.steps_checked = step + 1;
    }

    match &report.divergence {
        Some(d) => tracing::warn!(
            seed = episode.header().seed(),
            step = d.step,
            stream = d.stream,
            deviation = d.deviation,
            "replay diverged"
        ),
        None => tracing::debug!(
            seed = episode.header().seed(),
            steps = report.steps_checked,
            "replay matched"
        ),
    }
    Ok(report)
}
