//! Shared fixtures for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::array::NdArray;
use crate::config::SynthesisConfig;
use crate::error::{ControllerFault, EngineError};
use crate::geometry::{pose_at, Pose};
use crate::planner::{MotionPlanner, PlannedTrajectory};
use crate::scene::traits::{CameraSpec, WorldSetup};
use crate::scene::{KinematicSim, SceneController, SimEngine};
use crate::task::{Task, TaskKind, TaskSampler};
use crate::trajectory::types::{ActionRecord, Observation, SceneState, StepRecord};

/// Default configuration with a single square `front` camera.
pub fn small_config(side: usize) -> SynthesisConfig {
    let mut config = SynthesisConfig::default();
    config.scene.cameras = vec![CameraSpec {
        width: side,
        height: side,
        ..CameraSpec::default()
    }];
    config
}

pub fn reference_scene(config: &SynthesisConfig) -> SceneController<KinematicSim> {
    SceneController::from_config(KinematicSim::new(config.scene.robot.clone()), config)
}

pub fn task_of_kind(config: &SynthesisConfig, kind: TaskKind, seed: u64) -> Task {
    let mut sampler_config = config.sampler.clone();
    sampler_config.only(kind);
    TaskSampler::new(sampler_config, config.scene.layout.clone())
        .unwrap()
        .sample(seed)
        .unwrap()
}

/// A task from the default sampler that is known to be feasible.
pub fn sample_task(seed: u64) -> Task {
    let config = SynthesisConfig::default();
    task_of_kind(&config, TaskKind::Pick, seed)
}

/// `n` well-formed steps with `joints`-wide vectors and one `side`x`side`
/// `front` camera.
pub fn synthetic_steps(n: usize, joints: usize, side: usize) -> Vec<StepRecord> {
    (0..n)
        .map(|i| {
            let t = i as f64 * 0.01;
            let q: Vec<f64> = (0..joints).map(|j| t + j as f64 * 0.1).collect();
            let mut object_poses = BTreeMap::new();
            object_poses.insert("red_cube".to_string(), pose_at(0.5, 0.0, 0.02));
            let state = SceneState::new(q.clone(), object_poses, pose_at(0.4, t, 0.3), None, i as u64);
            let pixels = vec![(i % 256) as u8; side * side * 3];
            let mut camera_images = BTreeMap::new();
            camera_images.insert(
                "front".to_string(),
                NdArray::from_u8(vec![side, side, 3], pixels).unwrap(),
            );
            let commanded: Vec<f64> = q.iter().map(|v| v + 0.01).collect();
            StepRecord {
                observation: Observation {
                    step_index: i,
                    camera_images,
                    proprioception: q,
                    state,
                },
                action: ActionRecord {
                    step_index: i,
                    executed_action: commanded.clone(),
                    commanded_action: commanded,
                    reward: 0.0,
                },
            }
        })
        .collect()
}

/// Wraps an engine and injects a step failure after a fixed number of steps.
#[derive(Debug)]
pub struct FaultyEngine<E> {
    inner: E,
    fail_at: Option<u64>,
    steps: u64,
}

impl<E: SimEngine> FaultyEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            fail_at: None,
            steps: 0,
        }
    }

    pub fn fail_step_at(mut self, step: u64) -> Self {
        self.fail_at = Some(step);
        self
    }
}

impl<E: SimEngine> SimEngine for FaultyEngine<E> {
    fn reset(&mut self, setup: &WorldSetup) -> Result<(), EngineError> {
        self.steps = 0;
        self.inner.reset(setup)
    }

    fn step(&mut self, joint_targets: &[f64]) -> Result<(), EngineError> {
        if self.fail_at == Some(self.steps) {
            return Err(EngineError::Step("injected fault".into()));
        }
        self.steps += 1;
        self.inner.step(joint_targets)
    }

    fn render(&self, camera: &CameraSpec) -> Result<NdArray, EngineError> {
        self.inner.render(camera)
    }

    fn joint_positions(&self) -> Vec<f64> {
        self.inner.joint_positions()
    }

    fn end_effector_pose(&self) -> Pose {
        self.inner.end_effector_pose()
    }

    fn object_pose(&self, id: &str) -> Option<Pose> {
        self.inner.object_pose(id)
    }

    fn held_object(&self) -> Option<String> {
        self.inner.held_object()
    }

    fn in_contact(&self, id: &str) -> bool {
        self.inner.in_contact(id)
    }
}

/// Wraps a planner and injects planning or tracking faults.
#[derive(Debug)]
pub struct FaultyPlanner<P> {
    inner: P,
    unreachable: bool,
    diverge_after: Option<usize>,
    crash_once: Option<Arc<AtomicBool>>,
    tracked: usize,
}

impl<P: MotionPlanner> FaultyPlanner<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            unreachable: false,
            diverge_after: None,
            crash_once: None,
            tracked: 0,
        }
    }

    /// Every plan fails with [`ControllerFault::Unreachable`].
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Tracking diverges after `steps` successful actions.
    pub fn diverge_after(mut self, steps: usize) -> Self {
        self.diverge_after = Some(steps);
        self
    }

    /// The first `plan` call that finds `armed` set clears it and panics.
    pub fn crash_once(mut self, armed: Arc<AtomicBool>) -> Self {
        self.crash_once = Some(armed);
        self
    }
}

impl<P: MotionPlanner> MotionPlanner for FaultyPlanner<P> {
    fn plan(&mut self, task: &Task, state: &SceneState) -> Result<PlannedTrajectory, ControllerFault> {
        self.tracked = 0;
        if let Some(armed) = &self.crash_once {
            if armed.swap(false, Ordering::SeqCst) {
                panic!("injected planner crash");
            }
        }
        if self.unreachable {
            return Err(ControllerFault::Unreachable("injected: target outside reach".into()));
        }
        self.inner.plan(task, state)
    }

    fn track(
        &mut self,
        state: &SceneState,
        trajectory: &mut PlannedTrajectory,
    ) -> Result<Vec<f64>, ControllerFault> {
        if self.diverge_after == Some(self.tracked) {
            return Err(ControllerFault::TrackingDiverged {
                waypoint: self.tracked,
                error: 0.2,
                tolerance: 0.05,
            });
        }
        self.tracked += 1;
        self.inner.track(state, trajectory)
    }
}
