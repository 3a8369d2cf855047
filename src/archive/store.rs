//! Dataset directory management and atomic episode commits.
//!
//! ```text
//! <root>/dataset.json                  DatasetInfo
//! <root>/index.jsonl                   one IndexEntry per committed episode
//! <root>/episodes/episode_000042.vep   one file per episode
//! ```
//!
//! An episode file is the source of truth: it is written to a private temp
//! file in `episodes/` and renamed into place without clobbering, so a reader
//! either sees a complete file or nothing. The index is derived data and is
//! reconciled against the episode files on open.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::{Builder, NamedTempFile};

use crate::error::ArchiveError;
use crate::scene::traits::{CameraSpec, RobotSpec};
use crate::task::TaskKind;
use crate::trajectory::types::{Episode, EpisodeHeader, Outcome};

use super::format::{EpisodeFile, EPISODE_FORMAT_VERSION};

pub type EpisodeId = u64;

const DATASET_FILE: &str = "dataset.json";
const INDEX_FILE: &str = "index.jsonl";
const EPISODES_DIR: &str = "episodes";
const TEMP_PREFIX: &str = ".partial-";
const EPISODE_EXT: &str = "vep";

/// Minimum age before an orphaned temp file is treated as abandoned.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Dataset metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub name: String,
    pub width: usize,
    pub height: usize,
}

impl CameraInfo {
    pub fn frame_shape(&self) -> Vec<usize> {
        vec![self.height, self.width, 3]
    }
}

/// Dataset-wide metadata written once at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub joint_names: Vec<String>,
    pub cameras: Vec<CameraInfo>,
}

impl DatasetInfo {
    pub fn new(robot: &RobotSpec, cameras: &[CameraSpec]) -> Self {
        Self {
            format_version: EPISODE_FORMAT_VERSION,
            created_at: Utc::now(),
            joint_names: robot.joint_names.clone(),
            cameras: cameras
                .iter()
                .map(|c| CameraInfo {
                    name: c.name.clone(),
                    width: c.width,
                    height: c.height,
                })
                .collect(),
        }
    }

    /// Why `other` cannot share a dataset with `self`, if it cannot.
    fn incompatibility(&self, other: &DatasetInfo) -> Option<String> {
        if self.format_version != other.format_version {
            return Some(format!(
                "format version {} != {}",
                self.format_version, other.format_version
            ));
        }
        if self.joint_names != other.joint_names {
            return Some(format!(
                "joint layout {:?} != {:?}",
                self.joint_names, other.joint_names
            ));
        }
        if self.cameras != other.cameras {
            return Some("camera set or resolution differs".into());
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        let robot = RobotSpec::default();
        let camera = CameraSpec {
            width: 8,
            height: 8,
            ..CameraSpec::default()
        };
        Self::new(&robot, &[camera])
    }
}

/// One line of `index.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub episode_id: EpisodeId,
    pub file: String,
    pub outcome: Outcome,
    pub task_kind: TaskKind,
    pub instruction: String,
    pub length: usize,
    pub seed: u64,
    pub source_seed: u64,
    pub recorded_at: DateTime<Utc>,
}

impl IndexEntry {
    fn new(episode_id: EpisodeId, header: &EpisodeHeader) -> Self {
        Self {
            episode_id,
            file: episode_file_name(episode_id),
            outcome: header.outcome(),
            task_kind: header.task().kind(),
            instruction: header.task().instruction().to_string(),
            length: header.length(),
            seed: header.seed(),
            source_seed: header.source_seed(),
            recorded_at: header.recorded_at(),
        }
    }
}

/// Counts over the committed episodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArchiveSummary {
    pub episodes: usize,
    pub total_steps: usize,
    pub by_outcome: BTreeMap<Outcome, usize>,
    pub by_kind: BTreeMap<TaskKind, usize>,
}

fn episode_file_name(id: EpisodeId) -> String {
    format!("episode_{id:06}.{EPISODE_EXT}")
}

fn parse_episode_file_name(name: &str) -> Option<EpisodeId> {
    name.strip_prefix("episode_")?
        .strip_suffix(&format!(".{EPISODE_EXT}"))?
        .parse()
        .ok()
}

fn read_dataset_info(root: &Path) -> Result<DatasetInfo, ArchiveError> {
    let file = File::open(root.join(DATASET_FILE))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Ids of the committed episode files in `dir`.
///
/// With `sweep_stale`, temp files left behind for at least
/// [`STALE_TEMP_AGE`] are deleted. Younger ones may belong to a commit that
/// is still in flight.
fn scan_episode_files(dir: &Path, sweep_stale: bool) -> Result<BTreeSet<EpisodeId>, ArchiveError> {
    let mut files = BTreeSet::new();
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    for entry in listing {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(TEMP_PREFIX) {
            if sweep_stale && is_stale_temp(&entry) {
                tracing::warn!(file = %name, "removing stale partial episode");
                match fs::remove_file(entry.path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(file = %name, error = %e, "could not remove partial episode"),
                }
            }
        } else if let Some(id) = parse_episode_file_name(name) {
            files.insert(id);
        }
    }
    Ok(files)
}

fn is_stale_temp(entry: &fs::DirEntry) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= STALE_TEMP_AGE)
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// Append-only episode store. Shared across workers behind an `Arc`.
#[derive(Debug)]
pub struct EpisodeArchive {
    root: PathBuf,
    info: DatasetInfo,
    read_only: bool,
    next_id: AtomicU64,
    /// Guards both the in-memory entries and appends to `index.jsonl`.
    index: Mutex<Vec<IndexEntry>>,
}

impl EpisodeArchive {
    /// Open the dataset at `root`, creating it with `info` if absent.
    ///
    /// An existing dataset must have the same joint layout and cameras.
    /// Temp files older than [`STALE_TEMP_AGE`] are removed and episode files
    /// missing from the index are re-indexed.
    pub fn open_or_create(root: impl AsRef<Path>, info: DatasetInfo) -> Result<Self, ArchiveError> {
        let root = root.as_ref().to_path_buf();
        let episodes_dir = root.join(EPISODES_DIR);
        fs::create_dir_all(&episodes_dir)?;

        let info_path = root.join(DATASET_FILE);
        let info = if info_path.exists() {
            let existing = read_dataset_info(&root)?;
            if let Some(reason) = existing.incompatibility(&info) {
                return Err(ArchiveError::IncompatibleDataset { path: root, reason });
            }
            existing
        } else {
            let mut tmp = NamedTempFile::new_in(&root)?;
            {
                let mut writer = BufWriter::new(tmp.as_file_mut());
                serde_json::to_writer_pretty(&mut writer, &info)?;
                writer.flush()?;
            }
            tmp.persist(&info_path).map_err(|e| e.error)?;
            info
        };

        let files = scan_episode_files(&episodes_dir, true)?;
        let archive = Self::new(root, info, false);
        archive.restore(&files)?;
        Ok(archive)
    }

    /// Open an existing dataset for reading with the metadata it was created
    /// with.
    ///
    /// Nothing under `root` is created, removed or appended to, so this is
    /// safe while a writer is generating into the same directory. Episode
    /// files missing from the index are listed but not re-indexed, and
    /// [`commit`](Self::commit) fails with [`ArchiveError::ReadOnly`].
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let root = root.as_ref().to_path_buf();
        let info = read_dataset_info(&root)?;
        let files = scan_episode_files(&root.join(EPISODES_DIR), false)?;
        let archive = Self::new(root, info, true);
        archive.restore(&files)?;
        Ok(archive)
    }

    fn new(root: PathBuf, info: DatasetInfo, read_only: bool) -> Self {
        Self {
            root,
            info,
            read_only,
            next_id: AtomicU64::new(0),
            index: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild the in-memory index from `index.jsonl` and the episode files.
    fn restore(&self, files: &BTreeSet<EpisodeId>) -> Result<(), ArchiveError> {
        let mut entries = self.load_index(files)?;
        let indexed: BTreeSet<EpisodeId> = entries.iter().map(|e| e.episode_id).collect();
        for &id in files.difference(&indexed) {
            match self.read_episode(id) {
                Ok(episode) => {
                    let entry = IndexEntry::new(id, episode.header());
                    if !self.read_only {
                        self.append_index_line(&entry)?;
                        tracing::info!(episode_id = id, "re-indexed episode file");
                    }
                    entries.push(entry);
                }
                Err(e) => tracing::warn!(episode_id = id, error = %e, "skipping unreadable episode file"),
            }
        }
        entries.sort_by_key(|e| e.episode_id);

        let next = files.iter().next_back().map_or(0, |id| id + 1);
        self.next_id.store(next, Ordering::SeqCst);
        *self.lock_index() = entries;

        tracing::info!(
            root = %self.root.display(),
            episodes = self.len(),
            next_id = next,
            read_only = self.read_only,
            "opened episode archive"
        );
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    pub fn episode_path(&self, id: EpisodeId) -> PathBuf {
        self.root.join(EPISODES_DIR).join(episode_file_name(id))
    }

    /// Write `episode` as a new entry and return its id.
    ///
    /// Nothing becomes visible unless the whole file was written; the temp
    /// file is removed on every error path.
    pub fn commit(&self, episode: &Episode) -> Result<EpisodeId, ArchiveError> {
        if self.read_only {
            return Err(ArchiveError::ReadOnly(self.root.clone()));
        }
        self.check_shapes(episode)?;
        let file = EpisodeFile::from_episode(episode, &self.info)?;

        let mut tmp = Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(&format!(".{EPISODE_EXT}"))
            .tempfile_in(self.root.join(EPISODES_DIR))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            file.write_to(&mut writer)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;

        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            match tmp.persist_noclobber(self.episode_path(id)) {
                Ok(_) => break id,
                // Another process claimed this id.
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => tmp = e.file,
                Err(e) => return Err(e.error.into()),
            }
        };

        let entry = IndexEntry::new(id, episode.header());
        let mut index = self.lock_index();
        if let Err(e) = self.append_index_line(&entry) {
            drop(index);
            return self.roll_back_unindexed(entry, e);
        }
        index.push(entry);
        Ok(id)
    }

    /// Undo a commit whose episode file landed but whose index line did not.
    ///
    /// If the file cannot be removed it stays committed: it is kept in the
    /// in-memory index, the next writable open re-indexes it, and the id is
    /// returned so the caller's outcome matches what is on disk.
    fn roll_back_unindexed(&self, entry: IndexEntry, cause: ArchiveError) -> Result<EpisodeId, ArchiveError> {
        let id = entry.episode_id;
        let path = self.episode_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::error!(episode_id = id, error = %cause, "index append failed, removed episode file");
                Err(cause)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(cause),
            Err(e) => {
                tracing::error!(
                    episode_id = id,
                    path = %path.display(),
                    error = %cause,
                    remove_error = %e,
                    "index append failed and episode file could not be removed, keeping it committed"
                );
                self.lock_index().push(entry);
                Ok(id)
            }
        }
    }

    pub fn read_episode(&self, id: EpisodeId) -> Result<Episode, ArchiveError> {
        let path = self.episode_path(id);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ArchiveError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        EpisodeFile::read_from(&mut BufReader::new(file))?.into_episode()
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        self.lock_index().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> ArchiveSummary {
        let index = self.lock_index();
        let mut summary = ArchiveSummary {
            episodes: index.len(),
            ..ArchiveSummary::default()
        };
        for entry in index.iter() {
            summary.total_steps += entry.length;
            *summary.by_outcome.entry(entry.outcome).or_default() += 1;
            *summary.by_kind.entry(entry.task_kind).or_default() += 1;
        }
        summary
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock_index(&self) -> std::sync::MutexGuard<'_, Vec<IndexEntry>> {
        // A panic while holding the lock leaves the entries intact.
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append_index_line(&self, entry: &IndexEntry) -> Result<(), ArchiveError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(INDEX_FILE))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read `index.jsonl`, keeping only entries whose file still exists.
    fn load_index(&self, files: &BTreeSet<EpisodeId>) -> Result<Vec<IndexEntry>, ArchiveError> {
        let path = self.root.join(INDEX_FILE);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = BTreeMap::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexEntry>(&line) {
                Ok(entry) if files.contains(&entry.episode_id) => {
                    entries.insert(entry.episode_id, entry);
                }
                Ok(entry) => tracing::warn!(episode_id = entry.episode_id, "index entry without episode file"),
                Err(e) => tracing::warn!(line = n + 1, error = %e, "skipping malformed index line"),
            }
        }
        Ok(entries.into_values().collect())
    }

    fn check_shapes(&self, episode: &Episode) -> Result<(), ArchiveError> {
        let joints = self.info.joint_names.len();
        let incompatible = |reason: String| ArchiveError::IncompatibleDataset {
            path: self.root.clone(),
            reason,
        };
        for step in episode.steps() {
            let obs = &step.observation;
            if obs.proprioception.len() != joints {
                return Err(incompatible(format!(
                    "step {} has {} joints, dataset has {joints}",
                    obs.step_index,
                    obs.proprioception.len()
                )));
            }
            if obs.camera_images.len() != self.info.cameras.len() {
                return Err(incompatible(format!(
                    "step {} has {} cameras, dataset has {}",
                    obs.step_index,
                    obs.camera_images.len(),
                    self.info.cameras.len()
                )));
            }
            for camera in &self.info.cameras {
                match obs.camera_images.get(&camera.name) {
                    Some(frame) if frame.shape() == camera.frame_shape().as_slice() => {}
                    Some(frame) => {
                        return Err(incompatible(format!(
                            "camera `{}` frame {:?}, dataset has {:?}",
                            camera.name,
                            frame.shape(),
                            camera.frame_shape()
                        )))
                    }
                    None => return Err(incompatible(format!("missing camera `{}`", camera.name))),
                }
            }
        }
        Ok(())
    }
}
