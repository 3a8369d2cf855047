//! Task distribution: closed task kinds and the seeded sampler.

pub mod sampler;
pub mod types;

pub use sampler::TaskSampler;
pub use types::{Difficulty, PushDirection, Task, TaskKind, TaskTags};
