//! Episode orchestration: the lifecycle state machine, the single-episode
//! driver and the parallel worker pool.

pub mod pool;
pub mod runner;
pub mod state;

pub use pool::{run_generation, RunSummary};
pub use runner::{EpisodeOrchestrator, EpisodeReport};
pub use state::{EpisodeLifecycle, EpisodePhase};
