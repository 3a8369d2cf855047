//! Single-episode orchestration: sample, reset, plan, execute, record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::archive::{EpisodeArchive, EpisodeId};
use crate::config::EpisodeConfig;
use crate::error::{ExecutionFault, GenerationError, RecorderError, SceneError};
use crate::planner::MotionPlanner;
use crate::scene::{SceneController, SimEngine};
use crate::seed::attempt_seed;
use crate::task::{Task, TaskKind, TaskSampler};
use crate::trajectory::types::{ActionRecord, EpisodeHeader, Outcome, SceneState};
use crate::trajectory::TrajectoryRecorder;

use super::state::{EpisodeLifecycle, EpisodePhase};

/// What happened to one requested seed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeReport {
    /// Seed the caller asked for.
    pub seed: u64,
    /// Attempt that produced the episode; its seed is `attempt_seed(seed, attempt)`.
    pub attempt: u32,
    pub task_seed: u64,
    pub kind: TaskKind,
    pub instruction: String,
    pub outcome: Outcome,
    pub length: usize,
    /// `None` for aborted episodes.
    pub episode_id: Option<EpisodeId>,
    pub failure_reason: Option<String>,
}

/// How the step loop ended.
enum LoopEnd {
    Succeeded,
    BudgetExhausted,
    Cancelled,
    Fault(ExecutionFault),
}

/// Drives episodes for one engine instance.
///
/// Owns the scene controller, planner and sampler; shares the archive.
pub struct EpisodeOrchestrator<E: SimEngine, P: MotionPlanner> {
    sampler: TaskSampler,
    scene: SceneController<E>,
    planner: P,
    archive: Arc<EpisodeArchive>,
    config: EpisodeConfig,
    cancel: Arc<AtomicBool>,
}

impl<E: SimEngine, P: MotionPlanner> EpisodeOrchestrator<E, P> {
    pub fn new(
        sampler: TaskSampler,
        scene: SceneController<E>,
        planner: P,
        archive: Arc<EpisodeArchive>,
        config: EpisodeConfig,
    ) -> Self {
        Self {
            sampler,
            scene,
            planner,
            archive,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a stop flag; it is checked between steps.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn scene(&self) -> &SceneController<E> {
        &self.scene
    }

    /// Produce one episode for `seed`.
    ///
    /// Infeasible tasks are resampled and infeasible resets retried, each
    /// with a fresh attempt seed and within its own budget. Execution faults
    /// are recorded, never retried.
    pub fn generate(&mut self, seed: u64) -> Result<EpisodeReport, GenerationError> {
        let mut sample_failures = 0u32;
        let mut reset_failures = 0u32;
        let mut attempt = 0u32;
        loop {
            let task_seed = attempt_seed(seed, attempt);
            let task = match self.sampler.sample(task_seed) {
                Ok(task) => task,
                Err(e) if e.is_retryable() => {
                    sample_failures += 1;
                    if sample_failures > self.config.max_sample_retries {
                        return Err(GenerationError::TaskInfeasible {
                            seed,
                            attempts: sample_failures,
                            last: e,
                        });
                    }
                    tracing::warn!(seed, attempt, error = %e, "infeasible task, resampling");
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(GenerationError::Sampling(e)),
            };

            let mut lifecycle = EpisodeLifecycle::new(task_seed);
            lifecycle.transition(EpisodePhase::Resetting)?;
            let state = match self.scene.reset(&task) {
                Ok(state) => state,
                Err(e @ SceneError::Infeasible(_)) => {
                    lifecycle.transition(EpisodePhase::Aborted)?;
                    reset_failures += 1;
                    if reset_failures >= self.config.max_reset_attempts {
                        return Err(GenerationError::SceneInfeasible {
                            seed,
                            attempts: reset_failures,
                            last: e,
                        });
                    }
                    tracing::warn!(seed, attempt, error = %e, "scene reset infeasible, retrying");
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(GenerationError::Scene(e)),
            };
            lifecycle.transition(EpisodePhase::Executing)?;
            return self.execute(seed, attempt, task, state, lifecycle);
        }
    }

    fn execute(
        &mut self,
        seed: u64,
        attempt: u32,
        task: Task,
        mut state: SceneState,
        mut lifecycle: EpisodeLifecycle,
    ) -> Result<EpisodeReport, GenerationError> {
        let mut recorder = TrajectoryRecorder::new();
        let end = match self.run_steps(&task, &mut state, &mut recorder) {
            Ok(end) => end,
            Err(e) => {
                recorder.discard();
                return Err(e.into());
            }
        };

        let (outcome, failure_reason) = match end {
            LoopEnd::Succeeded => (Outcome::Succeeded, None),
            LoopEnd::BudgetExhausted if self.scene.query_success(&task) => (Outcome::Succeeded, None),
            LoopEnd::BudgetExhausted => {
                let fault = ExecutionFault::TimeoutExceeded {
                    max_steps: self.config.max_steps,
                };
                (fault.outcome(), Some(fault.to_string()))
            }
            LoopEnd::Cancelled => (Outcome::Aborted, Some("cancelled".to_string())),
            LoopEnd::Fault(fault) => (fault.outcome(), Some(fault.to_string())),
        };
        lifecycle.conclude(outcome)?;

        let mut report = EpisodeReport {
            seed,
            attempt,
            task_seed: task.seed(),
            kind: task.kind(),
            instruction: task.instruction().to_string(),
            outcome,
            length: recorder.len(),
            episode_id: None,
            failure_reason: failure_reason.clone(),
        };

        if outcome == Outcome::Aborted {
            tracing::warn!(seed, steps = recorder.len(), "episode aborted, discarding trajectory");
            recorder.discard();
            return Ok(report);
        }

        let header = EpisodeHeader::finalize(task, outcome, recorder.len(), seed, attempt, failure_reason);
        let id = match recorder.flush(header, &self.archive) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(seed, error = %e, "failed to archive episode");
                return Err(e.into());
            }
        };
        lifecycle.transition(EpisodePhase::Finalized)?;
        report.episode_id = Some(id);

        tracing::info!(
            seed,
            episode_id = id,
            kind = %report.kind,
            outcome = %outcome,
            steps = report.length,
            "episode archived"
        );
        Ok(report)
    }

    fn run_steps(
        &mut self,
        task: &Task,
        state: &mut SceneState,
        recorder: &mut TrajectoryRecorder,
    ) -> Result<LoopEnd, RecorderError> {
        let mut trajectory = match self.planner.plan(task, state) {
            Ok(t) => t,
            Err(fault) => return Ok(LoopEnd::Fault(fault.into())),
        };

        for step_index in 0..self.config.max_steps {
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(LoopEnd::Cancelled);
            }
            let observation = match self.scene.observe(state) {
                Ok(o) => o,
                Err(e) => return Ok(LoopEnd::Fault(e.into())),
            };
            let action = match self.planner.track(state, &mut trajectory) {
                Ok(a) => a,
                Err(fault) => return Ok(LoopEnd::Fault(fault.into())),
            };
            let (next, executed) = match self.scene.step(&action) {
                Ok(r) => r,
                Err(e) => return Ok(LoopEnd::Fault(e.into())),
            };
            let success = self.scene.query_success(task);
            recorder.append(
                observation,
                ActionRecord {
                    step_index,
                    commanded_action: action,
                    executed_action: executed,
                    reward: if success { 1.0 } else { 0.0 },
                },
            )?;
            *state = next;
            if success && self.config.early_termination {
                return Ok(LoopEnd::Succeeded);
            }
        }
        Ok(LoopEnd::BudgetExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DatasetInfo;
    use crate::config::SynthesisConfig;
    use crate::geometry::PlanarBounds;
    use crate::planner::InterpolatingPlanner;
    use crate::scene::KinematicSim;
    use crate::scene::layout::{Color, ObjectSpec, Shape};
    use crate::test_support::{small_config, FaultyEngine, FaultyPlanner};

    fn orchestrator_with<E: SimEngine>(
        config: &SynthesisConfig,
        engine: E,
        archive: Arc<EpisodeArchive>,
    ) -> EpisodeOrchestrator<E, InterpolatingPlanner> {
        with_planner(config, engine, InterpolatingPlanner::from_config(config), archive)
    }

    fn with_planner<E: SimEngine, P: MotionPlanner>(
        config: &SynthesisConfig,
        engine: E,
        planner: P,
        archive: Arc<EpisodeArchive>,
    ) -> EpisodeOrchestrator<E, P> {
        EpisodeOrchestrator::new(
            TaskSampler::new(config.sampler.clone(), config.scene.layout.clone()).unwrap(),
            SceneController::from_config(engine, config),
            planner,
            archive,
            config.episode.clone(),
        )
    }

    fn archive_for(config: &SynthesisConfig, dir: &std::path::Path) -> Arc<EpisodeArchive> {
        let info = DatasetInfo::new(&config.scene.robot, &config.cameras());
        Arc::new(EpisodeArchive::open_or_create(dir, info).unwrap())
    }

    #[test]
    fn seed_42_pick_and_place_with_short_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(16);
        config.episode.max_steps = 100;
        config.sampler.only(TaskKind::PickAndPlace);
        let archive = archive_for(&config, dir.path());
        let mut orch = orchestrator_with(&config, KinematicSim::new(config.scene.robot.clone()), archive.clone());

        let report = orch.generate(42).unwrap();
        assert!(report.length <= 100);
        assert!(matches!(report.outcome, Outcome::Succeeded | Outcome::Failed | Outcome::Timeout));
        assert_eq!(archive.len(), 1);

        let episode = archive.read_episode(report.episode_id.unwrap()).unwrap();
        assert_eq!(episode.len(), episode.header().length());
        assert_eq!(episode.header().outcome(), report.outcome);
        assert_eq!(episode.header().task().kind(), TaskKind::PickAndPlace);
    }

    #[test]
    fn reference_pick_succeeds_with_sparse_reward() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(8);
        config.sampler.only(TaskKind::Pick);
        let archive = archive_for(&config, dir.path());
        let mut orch = orchestrator_with(&config, KinematicSim::new(config.scene.robot.clone()), archive.clone());

        let report = orch.generate(7).unwrap();
        assert_eq!(report.outcome, Outcome::Succeeded);
        let episode = archive.read_episode(report.episode_id.unwrap()).unwrap();
        let rewards: Vec<f32> = episode.steps().iter().map(|s| s.action.reward).collect();
        assert_eq!(rewards.last(), Some(&1.0));
        assert_eq!(episode.total_reward(), 1.0);
    }

    #[test]
    fn fifty_step_episode_records_full_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(128);
        config.episode.max_steps = 50;
        config.sampler.only(TaskKind::Pick);
        let archive = archive_for(&config, dir.path());
        let mut orch = orchestrator_with(&config, KinematicSim::new(config.scene.robot.clone()), archive.clone());

        let report = orch.generate(3).unwrap();
        assert_eq!(report.outcome, Outcome::Timeout);
        assert_eq!(report.length, 50);
        let episode = archive.read_episode(report.episode_id.unwrap()).unwrap();
        assert_eq!(episode.len(), 50);
        for (i, step) in episode.steps().iter().enumerate() {
            assert_eq!(step.observation.step_index, i);
            assert_eq!(step.observation.camera_images["front"].shape(), &[128, 128, 3]);
            assert_eq!(step.observation.proprioception.len(), config.scene.robot.joint_count());
        }
    }

    #[test]
    fn always_infeasible_reset_reports_failure_and_archives_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(8);
        config.scene.layout.workspace = PlanarBounds::new(0.45, -0.05, 0.55, 0.05);
        config.sampler.only(TaskKind::Pick);
        let archive = archive_for(&config, dir.path());
        let mut orch = orchestrator_with(&config, KinematicSim::new(config.scene.robot.clone()), archive.clone());

        let err = orch.generate(1).unwrap_err();
        assert!(matches!(err, GenerationError::SceneInfeasible { attempts: 3, .. }));
        assert!(archive.is_empty());
    }

    #[test]
    fn engine_fault_mid_episode_is_recorded_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(8);
        let archive = archive_for(&config, dir.path());
        let engine = FaultyEngine::new(KinematicSim::new(config.scene.robot.clone())).fail_step_at(10);
        let mut orch = orchestrator_with(&config, engine, archive.clone());

        let report = orch.generate(11).unwrap();
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.length, 10);
        assert!(report.failure_reason.unwrap().contains("injected"));
        let episode = archive.read_episode(report.episode_id.unwrap()).unwrap();
        assert_eq!(episode.len(), 10);
        assert!(episode.header().failure_reason().is_some());
    }

    #[test]
    fn exhausted_task_resampling_reports_infeasible() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(8);
        config.scene.layout.objects = vec![ObjectSpec::new(Shape::Sphere, Color::Red)];
        config.sampler.only(TaskKind::Push);
        let archive = archive_for(&config, dir.path());
        let mut orch = orchestrator_with(&config, KinematicSim::new(config.scene.robot.clone()), archive.clone());

        let err = orch.generate(4).unwrap_err();
        let retries = config.episode.max_sample_retries;
        match err {
            GenerationError::TaskInfeasible { seed, attempts, last } => {
                assert_eq!(seed, 4);
                assert_eq!(attempts, retries + 1);
                assert!(last.is_retryable());
            }
            other => panic!("expected TaskInfeasible, got {other}"),
        }
        assert!(archive.is_empty());
    }

    #[test]
    fn unreachable_plan_is_archived_as_empty_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(8);
        config.sampler.only(TaskKind::Pick);
        let archive = archive_for(&config, dir.path());
        let planner = FaultyPlanner::new(InterpolatingPlanner::from_config(&config)).unreachable();
        let mut orch = with_planner(&config, KinematicSim::new(config.scene.robot.clone()), planner, archive.clone());

        let report = orch.generate(7).unwrap();
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.length, 0);
        assert!(report.failure_reason.unwrap().contains("unreachable"));

        let episode = archive.read_episode(report.episode_id.unwrap()).unwrap();
        assert!(episode.is_empty());
        assert_eq!(episode.header().outcome(), Outcome::Failed);
    }

    #[test]
    fn tracking_divergence_keeps_the_steps_before_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(8);
        config.sampler.only(TaskKind::Pick);
        let archive = archive_for(&config, dir.path());
        let planner = FaultyPlanner::new(InterpolatingPlanner::from_config(&config)).diverge_after(12);
        let mut orch = with_planner(&config, KinematicSim::new(config.scene.robot.clone()), planner, archive.clone());

        let report = orch.generate(7).unwrap();
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.length, 12);
        assert!(report.failure_reason.unwrap().contains("tracking diverged"));

        let episode = archive.read_episode(report.episode_id.unwrap()).unwrap();
        assert_eq!(episode.len(), 12);
        assert_eq!(episode.steps().last().unwrap().action.step_index, 11);
    }

    #[test]
    fn without_early_termination_the_full_budget_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(8);
        config.episode.early_termination = false;
        config.sampler.only(TaskKind::Pick);
        let budget = config.episode.max_steps;
        let archive = archive_for(&config, dir.path());
        let mut orch = orchestrator_with(&config, KinematicSim::new(config.scene.robot.clone()), archive.clone());

        let report = orch.generate(7).unwrap();
        assert_eq!(report.outcome, Outcome::Succeeded);
        assert_eq!(report.length, budget);

        let episode = archive.read_episode(report.episode_id.unwrap()).unwrap();
        let rewards: Vec<f32> = episode.steps().iter().map(|s| s.action.reward).collect();
        assert_eq!(rewards.len(), budget);
        assert_eq!(rewards.last(), Some(&1.0));
        assert!(episode.total_reward() > 1.0);
    }

    #[test]
    fn cancellation_aborts_without_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(8);
        let archive = archive_for(&config, dir.path());
        let cancel = Arc::new(AtomicBool::new(true));
        let mut orch = orchestrator_with(&config, KinematicSim::new(config.scene.robot.clone()), archive.clone())
            .with_cancel(cancel);

        let report = orch.generate(5).unwrap();
        assert_eq!(report.outcome, Outcome::Aborted);
        assert_eq!(report.episode_id, None);
        assert!(archive.is_empty());
    }

    #[test]
    fn same_seed_same_episode() {
        let config = small_config(8);
        let run = |dir: &std::path::Path| {
            let archive = archive_for(&config, dir);
            let mut orch = orchestrator_with(&config, KinematicSim::new(config.scene.robot.clone()), archive.clone());
            let report = orch.generate(21).unwrap();
            archive.read_episode(report.episode_id.unwrap()).unwrap()
        };
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (first, second) = (run(a.path()), run(b.path()));
        assert_eq!(first.steps(), second.steps());
        assert_eq!(first.header().task(), second.header().task());
    }
}
