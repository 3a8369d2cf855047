//! Durable episode storage: the binary episode format, the dataset
//! directory with its index, and replay verification.

pub mod format;
pub mod replay;
pub mod store;

pub use format::EpisodeFile;
pub use replay::{verify_replay, Divergence, ReplayReport};
pub use store::{ArchiveSummary, CameraInfo, DatasetInfo, EpisodeArchive, EpisodeId, IndexEntry};
