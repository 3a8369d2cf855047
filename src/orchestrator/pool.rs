//! Parallel generation over a seed range.
//!
//! Each worker owns its own engine, scene controller and planner and pulls
//! seeds from a shared cursor. The archive is the only shared state.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::archive::{EpisodeArchive, EpisodeId};
use crate::config::SynthesisConfig;
use crate::error::{GenerationError, SamplingError};
use crate::planner::MotionPlanner;
use crate::scene::{SceneController, SimEngine};
use crate::task::TaskSampler;
use crate::trajectory::types::Outcome;

use super::runner::{EpisodeOrchestrator, EpisodeReport};

/// What a worker has done so far, readable after it panics.
#[derive(Debug, Default)]
struct WorkerProgress {
    summary: RunSummary,
    in_flight: Option<u64>,
}

fn lock_progress(progress: &Mutex<WorkerProgress>) -> MutexGuard<'_, WorkerProgress> {
    progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Aggregate result of a generation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub by_outcome: BTreeMap<Outcome, u64>,
    /// Seeds for which no episode could be produced (infeasible or lifecycle errors).
    pub generation_failures: u64,
    /// Episodes that were produced but could not be written.
    pub archive_failures: u64,
    /// Workers that panicked. The seed each one was generating is listed in
    /// `failures`.
    pub worker_failures: u64,
    pub archived: Vec<EpisodeId>,
    /// `(seed, error)` for every failed seed.
    pub failures: Vec<(u64, String)>,
}

impl RunSummary {
    pub fn record(&mut self, seed: u64, result: &Result<EpisodeReport, GenerationError>) {
        match result {
            Ok(report) => {
                *self.by_outcome.entry(report.outcome).or_default() += 1;
                if let Some(id) = report.episode_id {
                    self.archived.push(id);
                }
            }
            Err(e @ GenerationError::Archive(_)) => {
                tracing::error!(seed, error = %e, "episode lost");
                self.archive_failures += 1;
                self.failures.push((seed, e.to_string()));
            }
            Err(e) => {
                tracing::warn!(seed, error = %e, "no episode for seed");
                self.generation_failures += 1;
                self.failures.push((seed, e.to_string()));
            }
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        for (outcome, n) in other.by_outcome {
            *self.by_outcome.entry(outcome).or_default() += n;
        }
        self.generation_failures += other.generation_failures;
        self.archive_failures += other.archive_failures;
        self.worker_failures += other.worker_failures;
        self.archived.extend(other.archived);
        self.failures.extend(other.failures);
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.by_outcome.get(&outcome).copied().unwrap_or(0)
    }

    /// Seeds that were picked up by a worker.
    pub fn attempted(&self) -> u64 {
        self.by_outcome.values().sum::<u64>()
            + self.generation_failures
            + self.archive_failures
            + self.worker_failures
    }

    /// Seeds that ran to a verdict: everything attempted except cancelled
    /// episodes.
    pub fn completed(&self) -> u64 {
        self.attempted() - self.count(Outcome::Aborted)
    }

    /// Succeeded episodes over [`completed`](Self::completed) seeds.
    pub fn success_fraction(&self) -> f64 {
        match self.completed() {
            0 => 0.0,
            n => self.count(Outcome::Succeeded) as f64 / n as f64,
        }
    }

    /// Whether the run may be reported as healthy: no worker panicked, every
    /// produced episode was written, and enough of them succeeded.
    pub fn meets(&self, min_success_fraction: f64) -> bool {
        self.worker_failures == 0
            && self.archive_failures == 0
            && self.success_fraction() >= min_success_fraction
    }
}

/// Generate one episode per seed in `seeds` using `config.run.workers`
/// blocking workers.
///
/// `engine_factory` and `planner_factory` are called once per worker with the
/// worker index. Setting `cancel` stops every worker after its current step.
pub async fn run_generation<E, P, FE, FP>(
    config: &SynthesisConfig,
    archive: Arc<EpisodeArchive>,
    engine_factory: FE,
    planner_factory: FP,
    seeds: Range<u64>,
    cancel: Arc<AtomicBool>,
) -> Result<RunSummary, SamplingError>
where
    E: SimEngine + 'static,
    P: MotionPlanner + 'static,
    FE: Fn(usize) -> E + Send + Sync + 'static,
    FP: Fn(usize) -> P + Send + Sync + 'static,
{
    let sampler = TaskSampler::new(config.sampler.clone(), config.scene.layout.clone())?;
    let config = Arc::new(config.clone());
    let engine_factory = Arc::new(engine_factory);
    let planner_factory = Arc::new(planner_factory);
    let cursor = Arc::new(AtomicU64::new(seeds.start));
    let end = seeds.end;
    let workers = config.run.workers.max(1);

    tracing::info!(
        workers,
        first_seed = seeds.start,
        episodes = end.saturating_sub(seeds.start),
        "starting generation"
    );

    let progress: Arc<Vec<Mutex<WorkerProgress>>> =
        Arc::new((0..workers).map(|_| Mutex::default()).collect());
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let sampler = sampler.clone();
        let config = Arc::clone(&config);
        let archive = Arc::clone(&archive);
        let engine_factory = Arc::clone(&engine_factory);
        let planner_factory = Arc::clone(&planner_factory);
        let cursor = Arc::clone(&cursor);
        let cancel = Arc::clone(&cancel);
        let progress = Arc::clone(&progress);

        handles.push(tokio::task::spawn_blocking(move || {
            let scene = SceneController::from_config(engine_factory(worker), &config);
            let mut orchestrator = EpisodeOrchestrator::new(
                sampler,
                scene,
                planner_factory(worker),
                archive,
                config.episode.clone(),
            )
            .with_cancel(Arc::clone(&cancel));

            let progress = &progress[worker];
            while !cancel.load(Ordering::Relaxed) {
                let seed = cursor.fetch_add(1, Ordering::Relaxed);
                if seed >= end {
                    break;
                }
                lock_progress(progress).in_flight = Some(seed);
                let result = orchestrator.generate(seed);
                let mut done = lock_progress(progress);
                done.summary.record(seed, &result);
                done.in_flight = None;
            }
            tracing::debug!(worker, attempted = lock_progress(progress).summary.attempted(), "worker finished");
        }));
    }

    let mut total = RunSummary::default();
    for (worker, handle) in handles.into_iter().enumerate() {
        let joined = handle.await;
        let WorkerProgress { summary, in_flight } = std::mem::take(&mut *lock_progress(&progress[worker]));
        total.merge(summary);
        if let Err(e) = joined {
            total.worker_failures += 1;
            match in_flight {
                Some(seed) => {
                    tracing::error!(worker, seed, error = %e, "worker failed mid-episode");
                    total.failures.push((seed, format!("worker failed: {e}")));
                }
                None => tracing::error!(worker, error = %e, "worker failed"),
            }
        }
    }
    total.failures.sort_by_key(|(seed, _)| *seed);
    total.archived.sort_unstable();

    tracing::info!(
        attempted = total.attempted(),
        archived = total.archived.len(),
        succeeded = total.count(Outcome::Succeeded),
        success_fraction = format!("{:.2}%", total.success_fraction() * 100.0),
        "generation finished"
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DatasetInfo;
    use crate::planner::InterpolatingPlanner;
    use crate::scene::KinematicSim;
    use crate::test_support::{small_config, FaultyPlanner};

    fn archive_in(config: &SynthesisConfig, dir: &std::path::Path) -> Arc<EpisodeArchive> {
        let info = DatasetInfo::new(&config.scene.robot, &config.cameras());
        Arc::new(EpisodeArchive::open_or_create(dir, info).unwrap())
    }

    async fn run(config: &SynthesisConfig, archive: Arc<EpisodeArchive>, seeds: Range<u64>) -> RunSummary {
        let robot = config.scene.robot.clone();
        let planner_config = config.clone();
        run_generation(
            config,
            archive,
            move |_| KinematicSim::new(robot.clone()),
            move |_| InterpolatingPlanner::from_config(&planner_config),
            seeds,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn every_seed_is_generated_once_across_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(8);
        config.run.workers = 4;
        let archive = archive_in(&config, dir.path());

        let summary = run(&config, archive.clone(), 100..112).await;
        assert_eq!(summary.attempted(), 12);
        assert_eq!(summary.worker_failures, 0);
        assert_eq!(summary.archived.len() as u64, 12 - summary.generation_failures);
        assert_eq!(archive.len(), summary.archived.len());

        let mut seeds: Vec<u64> = archive.entries().iter().map(|e| e.source_seed).collect();
        seeds.sort_unstable();
        seeds.dedup();
        assert_eq!(seeds.len(), archive.len());
        assert!(summary.meets(0.0));
    }

    #[tokio::test]
    async fn parallel_run_matches_sequential_run() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let mut config = small_config(8);
        let sequential = archive_in(&config, a.path());
        run(&config, sequential.clone(), 0..6).await;
        config.run.workers = 3;
        let parallel = archive_in(&config, b.path());
        run(&config, parallel.clone(), 0..6).await;

        let key = |archive: &EpisodeArchive| {
            let mut v: Vec<(u64, Outcome, usize, String)> = archive
                .entries()
                .into_iter()
                .map(|e| (e.source_seed, e.outcome, e.length, e.instruction))
                .collect();
            v.sort_by_key(|k| k.0);
            v
        };
        assert_eq!(key(&sequential), key(&parallel));
    }

    #[tokio::test]
    async fn cancelled_run_produces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(8);
        let archive = archive_in(&config, dir.path());
        let robot = config.scene.robot.clone();
        let planner_config = config.clone();
        let summary = run_generation(
            &config,
            archive.clone(),
            move |_| KinematicSim::new(robot.clone()),
            move |_| InterpolatingPlanner::from_config(&planner_config),
            0..10,
            Arc::new(AtomicBool::new(true)),
        )
        .await
        .unwrap();
        assert_eq!(summary.attempted(), 0);
        assert!(archive.is_empty());
    }

    #[tokio::test]
    async fn lost_episodes_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(8);
        // Frames from this run do not match the dataset's 16x16 camera.
        let archive = archive_in(&small_config(16), dir.path());

        let summary = run(&config, archive.clone(), 0..3).await;
        assert_eq!(summary.attempted(), 3);
        assert!(summary.archive_failures > 0);
        assert_eq!(summary.archive_failures + summary.generation_failures, 3);
        assert!(summary.archived.is_empty());
        assert!(archive.is_empty());
        assert!(!summary.meets(0.0));
    }

    #[tokio::test]
    async fn crashed_worker_reports_its_seed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(8);
        config.run.workers = 2;
        let archive = archive_in(&config, dir.path());
        let robot = config.scene.robot.clone();
        let planner_config = config.clone();
        let armed = Arc::new(AtomicBool::new(true));
        let summary = run_generation(
            &config,
            archive.clone(),
            move |_| KinematicSim::new(robot.clone()),
            move |_| FaultyPlanner::new(InterpolatingPlanner::from_config(&planner_config)).crash_once(Arc::clone(&armed)),
            0..6,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(summary.worker_failures, 1);
        assert_eq!(summary.attempted(), 6);
        let crashed: Vec<u64> = summary
            .failures
            .iter()
            .filter(|(_, reason)| reason.contains("worker failed"))
            .map(|(seed, _)| *seed)
            .collect();
        assert_eq!(crashed.len(), 1);
        assert!(archive.entries().iter().all(|e| e.source_seed != crashed[0]));
        assert!(!summary.meets(0.0));
    }

    #[test]
    fn aborted_episodes_do_not_count_against_success() {
        let mut summary = RunSummary::default();
        summary.by_outcome.insert(Outcome::Succeeded, 3);
        summary.by_outcome.insert(Outcome::Failed, 1);
        summary.by_outcome.insert(Outcome::Aborted, 2);
        assert_eq!(summary.attempted(), 6);
        assert_eq!(summary.completed(), 4);
        assert!((summary.success_fraction() - 0.75).abs() < 1e-12);

        summary.archive_failures = 1;
        assert!(!summary.meets(0.0));
    }

    #[test]
    fn success_fraction_counts_failed_seeds() {
        let mut summary = RunSummary::default();
        summary.by_outcome.insert(Outcome::Succeeded, 3);
        summary.by_outcome.insert(Outcome::Timeout, 1);
        summary.generation_failures = 1;
        assert!((summary.success_fraction() - 0.6).abs() < 1e-12);
        assert!(summary.meets(0.5));
        assert!(!summary.meets(0.7));
        assert_eq!(RunSummary::default().success_fraction(), 0.0);
    }
}
