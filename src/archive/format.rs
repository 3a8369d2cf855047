//! Episode file format.
//!
//! # File Format
//!
//! 1. **Magic bytes**: `VEP1` (4 bytes)
//! 2. **Version**: `u32` little-endian (4 bytes)
//! 3. **Flags**: `u32` little-endian (4 bytes), see [`FLAG_SCENE_STATES`]
//! 4. **Payload**: bincode-encoded [`EpisodeFile`]
//!
//! The payload stores streams column-wise: one stacked array per camera and
//! one per numeric stream, each carrying its own dtype and shape, so a reader
//! can recover every per-step sample without replaying the simulation.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::array::{DType, NdArray};
use crate::error::ArchiveError;
use crate::trajectory::types::{ActionRecord, Episode, EpisodeHeader, Observation, SceneState, StepRecord};

use super::store::DatasetInfo;

/// Magic bytes identifying an episode file.
pub const EPISODE_MAGIC: [u8; 4] = *b"VEP1";

/// Current episode format version.
pub const EPISODE_FORMAT_VERSION: u32 = 1;

/// Header size in bytes (magic + version + flags).
pub const EPISODE_HEADER_SIZE: usize = 12;

/// The payload carries per-step scene states.
pub const FLAG_SCENE_STATES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileHeader {
    magic: [u8; 4],
    version: u32,
    flags: u32,
}

impl FileHeader {
    fn current() -> Self {
        Self {
            magic: EPISODE_MAGIC,
            version: EPISODE_FORMAT_VERSION,
            flags: FLAG_SCENE_STATES,
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut bytes = [0u8; EPISODE_HEADER_SIZE];
        reader.read_exact(&mut bytes)?;
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: word(4),
            flags: word(8),
        })
    }

    fn validate(&self) -> Result<(), ArchiveError> {
        if self.magic != EPISODE_MAGIC {
            return Err(ArchiveError::BadMagic(self.magic));
        }
        if self.version != EPISODE_FORMAT_VERSION {
            return Err(ArchiveError::UnsupportedVersion(self.version));
        }
        if self.flags & FLAG_SCENE_STATES == 0 {
            return Err(ArchiveError::Corrupt("episode file carries no scene states".into()));
        }
        Ok(())
    }
}

/// Column-wise episode payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeFile {
    pub header: EpisodeHeader,
    /// Camera name -> `(N, H, W, 3)` `uint8`.
    pub images: BTreeMap<String, NdArray>,
    /// `(N, J)` `float64`.
    pub proprioception: NdArray,
    /// `(N, J)` `float64`.
    pub commanded: NdArray,
    /// `(N, J)` `float64`.
    pub executed: NdArray,
    /// `(N,)` `float32`.
    pub rewards: NdArray,
    pub states: Vec<SceneState>,
}

impl EpisodeFile {
    /// Transpose an episode into columns. `info` supplies item shapes so an
    /// empty episode still produces well-formed arrays.
    pub fn from_episode(episode: &Episode, info: &DatasetInfo) -> Result<Self, ArchiveError> {
        let steps = episode.steps();
        let joints = info.joint_names.len();

        let mut images = BTreeMap::new();
        for camera in &info.cameras {
            let frames = steps
                .iter()
                .map(|s| {
                    s.observation.camera_images.get(&camera.name).ok_or_else(|| {
                        ArchiveError::Corrupt(format!(
                            "step {} has no frame from camera `{}`",
                            s.observation.step_index, camera.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let stacked = NdArray::stack(DType::Uint8, &camera.frame_shape(), frames)?;
            images.insert(camera.name.clone(), stacked);
        }

        let proprioception = joint_column(steps, joints, |s| s.observation.proprioception.as_slice())?;
        let commanded = joint_column(steps, joints, |s| s.action.commanded_action.as_slice())?;
        let executed = joint_column(steps, joints, |s| s.action.executed_action.as_slice())?;

        let rewards: Vec<f32> = steps.iter().map(|s| s.action.reward).collect();
        let rewards = NdArray::from_f32(vec![steps.len()], &rewards)?;

        Ok(Self {
            header: episode.header().clone(),
            images,
            proprioception,
            commanded,
            executed,
            rewards,
            states: steps.iter().map(|s| s.observation.state.clone()).collect(),
        })
    }

    /// Rebuild per-step records, checking every column against the header length.
    pub fn into_episode(self) -> Result<Episode, ArchiveError> {
        let n = self.header.length();
        let check = |name: &str, leading: usize| {
            if leading == n {
                Ok(())
            } else {
                Err(ArchiveError::Corrupt(format!(
                    "{name} has {leading} rows, header says {n}"
                )))
            }
        };

        let mut frames: BTreeMap<String, std::vec::IntoIter<NdArray>> = BTreeMap::new();
        for (name, stacked) in &self.images {
            let items = stacked.unstack()?;
            check(name, items.len())?;
            frames.insert(name.clone(), items.into_iter());
        }
        let rows = |array: &NdArray, name: &str| -> Result<Vec<Vec<f64>>, ArchiveError> {
            let items = array.unstack()?;
            check(name, items.len())?;
            Ok(items.iter().map(NdArray::to_f64_vec).collect())
        };
        let proprioception = rows(&self.proprioception, "proprioception")?;
        let commanded = rows(&self.commanded, "commanded")?;
        let executed = rows(&self.executed, "executed")?;
        let rewards = self.rewards.to_f32_vec();
        check("rewards", rewards.len())?;
        check("states", self.states.len())?;

        let mut steps = Vec::with_capacity(n);
        let columns = proprioception
            .into_iter()
            .zip(commanded)
            .zip(executed)
            .zip(rewards)
            .zip(self.states);
        for (i, ((((proprioception, commanded_action), executed_action), reward), state)) in
            columns.enumerate()
        {
            let mut camera_images = BTreeMap::new();
            for (name, iter) in frames.iter_mut() {
                let frame = iter
                    .next()
                    .ok_or_else(|| ArchiveError::Corrupt(format!("camera `{name}` ran out of frames")))?;
                camera_images.insert(name.clone(), frame);
            }
            steps.push(StepRecord {
                observation: Observation {
                    step_index: i,
                    camera_images,
                    proprioception,
                    state,
                },
                action: ActionRecord {
                    step_index: i,
                    commanded_action,
                    executed_action,
                    reward,
                },
            });
        }
        Episode::new(self.header, steps)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ArchiveError> {
        FileHeader::current().write_to(writer)?;
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ArchiveError> {
        let header = FileHeader::read_from(reader)?;
        header.validate()?;
        let file: Self = bincode::deserialize_from(reader)?;
        for array in file
            .images
            .values()
            .chain([&file.proprioception, &file.commanded, &file.executed, &file.rewards])
        {
            array.validate()?;
        }
        Ok(file)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, ArchiveError> {
        Self::read_from(&mut bytes)
    }
}

fn joint_column(
    steps: &[StepRecord],
    joints: usize,
    row: impl Fn(&StepRecord) -> &[f64],
) -> Result<NdArray, ArchiveError> {
    let mut values = Vec::with_capacity(steps.len() * joints);
    for step in steps {
        let row = row(step);
        if row.len() != joints {
            return Err(ArchiveError::Corrupt(format!(
                "step {} has {} joint values, dataset has {joints}",
                step.action.step_index,
                row.len()
            )));
        }
        values.extend_from_slice(row);
    }
    NdArray::from_f64(vec![steps.len(), joints], &values)
}
