//! In-memory step buffer for the episode being executed.
//!
//! The [`TrajectoryRecorder`] accepts one `(Observation, ActionRecord)` pair
//! per step, rejecting anything that would break stream alignment, and hands
//! the whole buffer to the archive in a single commit at the end of the
//! episode. Nothing touches the disk before [`TrajectoryRecorder::flush`].

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::archive::{EpisodeArchive, EpisodeId};
use crate::error::{ArchiveError, RecorderError};

use super::types::{ActionRecord, Episode, EpisodeHeader, Observation, StepRecord};

#[derive(Debug)]
pub struct TrajectoryRecorder {
    buffer_id: Uuid,
    steps: Vec<StepRecord>,
    /// Shapes fixed by the first step; later steps must match.
    image_shapes: BTreeMap<String, Vec<usize>>,
    joint_count: Option<usize>,
}

impl Default for TrajectoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrajectoryRecorder {
    pub fn new() -> Self {
        Self {
            buffer_id: Uuid::new_v4(),
            steps: Vec::new(),
            image_shapes: BTreeMap::new(),
            joint_count: None,
        }
    }

    pub fn buffer_id(&self) -> Uuid {
        self.buffer_id
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn append(&mut self, observation: Observation, action: ActionRecord) -> Result<(), RecorderError> {
        let expected = self.steps.len();
        if observation.step_index != expected || action.step_index != expected {
            return Err(RecorderError::Misaligned {
                expected,
                observation: observation.step_index,
                action: action.step_index,
            });
        }

        let joints = observation.proprioception.len();
        let joint_count = *self.joint_count.get_or_insert(joints);
        for (stream, len) in [
            ("proprioception", joints),
            ("commanded_action", action.commanded_action.len()),
            ("executed_action", action.executed_action.len()),
        ] {
            if len != joint_count {
                return Err(RecorderError::ShapeMismatch {
                    stream: stream.to_string(),
                    expected: vec![joint_count],
                    got: vec![len],
                });
            }
        }

        if self.steps.is_empty() {
            self.image_shapes = observation
                .camera_images
                .iter()
                .map(|(name, frame)| (name.clone(), frame.shape().to_vec()))
                .collect();
        } else {
            if !observation.camera_images.keys().eq(self.image_shapes.keys()) {
                return Err(RecorderError::ShapeMismatch {
                    stream: "camera_images".into(),
                    expected: vec![self.image_shapes.len()],
                    got: vec![observation.camera_images.len()],
                });
            }
            for (name, frame) in &observation.camera_images {
                let expected = &self.image_shapes[name];
                if frame.shape() != expected.as_slice() {
                    return Err(RecorderError::ShapeMismatch {
                        stream: format!("camera `{name}`"),
                        expected: expected.clone(),
                        got: frame.shape().to_vec(),
                    });
                }
            }
        }

        self.steps.push(StepRecord { observation, action });
        Ok(())
    }

    /// Pair the buffer with its header. Fails if the lengths disagree.
    pub fn into_episode(self, header: EpisodeHeader) -> Result<Episode, ArchiveError> {
        Episode::new(header, self.steps)
    }

    /// Commit the buffered steps as one archive entry.
    ///
    /// The buffer is consumed whether or not the commit succeeds.
    pub fn flush(self, header: EpisodeHeader, archive: &EpisodeArchive) -> Result<EpisodeId, ArchiveError> {
        let buffer_id = self.buffer_id;
        let episode = self.into_episode(header)?;
        let id = archive.commit(&episode)?;
        tracing::debug!(%buffer_id, episode_id = id, steps = episode.len(), "flushed trajectory buffer");
        Ok(id)
    }

    /// Drop everything buffered without writing.
    pub fn discard(self) {
        tracing::debug!(buffer_id = %self.buffer_id, steps = self.steps.len(), "discarded trajectory buffer");
    }
}
