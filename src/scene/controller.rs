//! The scene controller: the only component that mutates the simulation.

use std::collections::BTreeMap;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::array::NdArray;
use crate::config::{PlacementConfig, RandomizationConfig, SceneConfig, SynthesisConfig};
use crate::error::SceneError;
use crate::geometry::{pose_at_yaw, PlanarBounds, Pose};
use crate::seed::subsystem_rng;
use crate::task::types::SuccessView;
use crate::task::Task;
use crate::trajectory::types::{Observation, SceneState};

use super::layout::{ObjectSpec, SceneGeometry, SceneLayout, SupportSurface};
use super::traits::{CameraSpec, Lighting, PlacedObject, RobotSpec, SimEngine, WorldSetup};

/// Drives one engine instance through resets and steps.
///
/// `step` takes `&mut self`, so a controller can only ever be advanced by one
/// caller at a time.
#[derive(Debug)]
pub struct SceneController<E: SimEngine> {
    engine: E,
    layout: SceneLayout,
    robot: RobotSpec,
    /// Nominal cameras from configuration.
    cameras: Vec<CameraSpec>,
    /// Cameras after this episode's randomization.
    active_cameras: Vec<CameraSpec>,
    randomization: RandomizationConfig,
    placement: PlacementConfig,
    tolerance: f64,
    step_index: u64,
}

impl<E: SimEngine> SceneController<E> {
    pub fn new(engine: E, scene: &SceneConfig, cameras: Vec<CameraSpec>) -> Self {
        Self {
            engine,
            layout: scene.layout.clone(),
            robot: scene.robot.clone(),
            active_cameras: cameras.clone(),
            cameras,
            randomization: scene.randomization.clone(),
            placement: scene.placement.clone(),
            tolerance: scene.success.position_tolerance,
            step_index: 0,
        }
    }

    pub fn from_config(engine: E, config: &SynthesisConfig) -> Self {
        Self::new(engine, &config.scene, config.cameras())
    }

    pub fn robot(&self) -> &RobotSpec {
        &self.robot
    }

    pub fn layout(&self) -> &SceneLayout {
        &self.layout
    }

    /// Cameras as randomized by the last reset.
    pub fn cameras(&self) -> &[CameraSpec] {
        &self.active_cameras
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Reset the world for `task`.
    ///
    /// All randomization is drawn from `task.seed()`, so resetting twice with
    /// the same task rebuilds the same world.
    pub fn reset(&mut self, task: &Task) -> Result<SceneState, SceneError> {
        let mut rng = subsystem_rng(task.seed(), "scene");

        self.active_cameras = self
            .cameras
            .iter()
            .map(|c| self.randomize_camera(c, &mut rng))
            .collect();
        let lighting = self.randomize_lighting(&mut rng);
        let objects = self.place_objects(task, &mut rng)?;

        self.engine.reset(&WorldSetup {
            robot_joints: self.robot.home.clone(),
            objects,
            supports: self.layout.supports.clone(),
            lighting,
        })?;
        self.step_index = 0;
        tracing::debug!(seed = task.seed(), target = task.target_object_id(), "scene reset");
        Ok(self.snapshot())
    }

    /// Apply `action` as joint targets for one control tick.
    ///
    /// Returns the new state and the action actually sent to the engine after
    /// clipping to joint limits and the per-tick delta.
    pub fn step(&mut self, action: &[f64]) -> Result<(SceneState, Vec<f64>), SceneError> {
        let executed = self.clip_action(action)?;
        self.engine.step(&executed)?;
        self.step_index += 1;
        Ok((self.snapshot(), executed))
    }

    pub fn clip_action(&self, action: &[f64]) -> Result<Vec<f64>, SceneError> {
        let n = self.robot.joint_count();
        if action.len() != n {
            return Err(SceneError::ActionDimension {
                expected: n,
                got: action.len(),
            });
        }
        if let Some(i) = action.iter().position(|a| !a.is_finite()) {
            return Err(SceneError::NonFiniteAction(i));
        }
        let current = self.engine.joint_positions();
        let delta = self.robot.max_joint_delta;
        Ok(action
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let q = a.clamp(self.robot.lower[i], self.robot.upper[i]);
                match current.get(i) {
                    Some(c) => q.clamp(c - delta, c + delta),
                    None => q,
                }
            })
            .collect())
    }

    pub fn render(&self, camera: &str) -> Result<NdArray, SceneError> {
        let spec = self
            .active_cameras
            .iter()
            .find(|c| c.name == camera)
            .ok_or_else(|| SceneError::UnknownCamera(camera.to_string()))?;
        Ok(self.engine.render(spec)?)
    }

    /// Render every camera and pair the frames with `state`.
    pub fn observe(&self, state: &SceneState) -> Result<Observation, SceneError> {
        let mut camera_images = BTreeMap::new();
        for camera in &self.active_cameras {
            camera_images.insert(camera.name.clone(), self.engine.render(camera)?);
        }
        Ok(Observation {
            step_index: state.timestamp() as usize,
            camera_images,
            proprioception: state.robot_joint_positions().to_vec(),
            state: state.clone(),
        })
    }

    pub fn query_success(&self, task: &Task) -> bool {
        let id = task.target_object_id();
        let Some(pose) = self.engine.object_pose(id) else {
            return false;
        };
        let view = SuccessView {
            object_pose: &pose,
            held: self.engine.held_object().as_deref() == Some(id),
            in_contact: self.engine.in_contact(id),
            tolerance: self.tolerance,
        };
        task.kind().is_satisfied(task.goal_pose(), &view)
    }

    fn snapshot(&self) -> SceneState {
        let object_poses = self
            .layout
            .objects
            .iter()
            .filter_map(|o| self.engine.object_pose(&o.id).map(|p| (o.id.clone(), p)))
            .collect();
        SceneState::new(
            self.engine.joint_positions(),
            object_poses,
            self.engine.end_effector_pose(),
            self.engine.held_object(),
            self.step_index,
        )
    }

    // -----------------------------------------------------------------------
    // Randomization
    // -----------------------------------------------------------------------

    fn randomize_camera(&self, nominal: &CameraSpec, rng: &mut ChaCha8Rng) -> CameraSpec {
        let jitter = |v: [f64; 3], noise: f64, rng: &mut ChaCha8Rng| {
            if noise > 0.0 {
                v.map(|c| c + rng.gen_range(-noise..=noise))
            } else {
                v
            }
        };
        CameraSpec {
            position: jitter(nominal.position, self.randomization.camera_position_noise, rng),
            look_at: jitter(nominal.look_at, self.randomization.camera_look_at_noise, rng),
            ..nominal.clone()
        }
    }

    fn randomize_lighting(&self, rng: &mut ChaCha8Rng) -> Lighting {
        let r = &self.randomization;
        let mut position = [0.0; 3];
        for (i, p) in position.iter_mut().enumerate() {
            *p = rng.gen_range(r.light_position_min[i]..=r.light_position_max[i]);
        }
        Lighting {
            position,
            intensity: rng.gen_range(r.light_intensity_min..=r.light_intensity_max),
        }
    }

    /// Rejection-sample collision-free poses, target first.
    fn place_objects(&self, task: &Task, rng: &mut ChaCha8Rng) -> Result<Vec<PlacedObject>, SceneError> {
        let target = self.layout.object(task.target_object_id()).ok_or_else(|| {
            SceneError::Infeasible(format!("target `{}` is not in the scene", task.target_object_id()))
        })?;
        let table_top = self.layout.table().map_or(0.0, |t| t.top);
        let goal = task.goal_pose().translation;
        let goal_disc = (goal.x, goal.y, target.shape.footprint_radius());

        let mut placed: Vec<PlacedObject> = Vec::with_capacity(self.layout.objects.len());
        if let Some(start) = task.start_pose() {
            let t = start.translation;
            if !self.is_free(target, t.x, t.y, &placed, None) {
                return Err(SceneError::Infeasible(format!(
                    "imposed start of `{}` at ({:.3}, {:.3}) is blocked",
                    target.id, t.x, t.y
                )));
            }
            placed.push(PlacedObject {
                spec: target.clone(),
                pose: *start,
            });
        } else {
            let pose = self.sample_pose(target, table_top, &placed, goal_disc, rng)?;
            placed.push(PlacedObject {
                spec: target.clone(),
                pose,
            });
        }

        for spec in self.layout.objects.iter().filter(|o| o.id != target.id) {
            let pose = self.sample_pose(spec, table_top, &placed, goal_disc, rng)?;
            placed.push(PlacedObject {
                spec: spec.clone(),
                pose,
            });
        }
        Ok(placed)
    }

    fn sample_pose(
        &self,
        spec: &ObjectSpec,
        table_top: f64,
        placed: &[PlacedObject],
        goal_disc: (f64, f64, f64),
        rng: &mut ChaCha8Rng,
    ) -> Result<Pose, SceneError> {
        let region = self
            .layout
            .workspace
            .shrink(spec.shape.footprint_radius())
            .ok_or_else(|| SceneError::Infeasible(format!("workspace too small for `{}`", spec.id)))?;
        for _ in 0..self.placement.max_tries {
            let x = rng.gen_range(region.min[0]..=region.max[0]);
            let y = rng.gen_range(region.min[1]..=region.max[1]);
            let yaw = if self.randomization.object_yaw {
                rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI)
            } else {
                0.0
            };
            if self.is_free(spec, x, y, placed, Some(goal_disc)) {
                return Ok(pose_at_yaw(x, y, spec.rest_height(table_top), yaw));
            }
        }
        Err(SceneError::Infeasible(format!(
            "could not place `{}` after {} tries",
            spec.id, self.placement.max_tries
        )))
    }

    fn is_free(
        &self,
        spec: &ObjectSpec,
        x: f64,
        y: f64,
        placed: &[PlacedObject],
        goal_disc: Option<(f64, f64, f64)>,
    ) -> bool {
        let r = spec.shape.footprint_radius();
        let gap = self.placement.clearance;
        if !self.layout.workspace.contains_disc(x, y, r) {
            return false;
        }
        if x.hypot(y) < self.layout.robot_base_clearance + r {
            return false;
        }
        if self.layout.fixtures().any(|f| f.bounds.intersects_disc(x, y, r + gap)) {
            return false;
        }
        let clear_of = |ox: f64, oy: f64, or: f64| (x - ox).hypot(y - oy) >= r + or + gap;
        if let Some((gx, gy, gr)) = goal_disc {
            if !clear_of(gx, gy, gr) {
                return false;
            }
        }
        placed.iter().all(|p| {
            let t = p.pose.translation;
            clear_of(t.x, t.y, p.spec.shape.footprint_radius())
        })
    }
}

impl<E: SimEngine> SceneGeometry for SceneController<E> {
    fn manipulable_objects(&self) -> &[ObjectSpec] {
        &self.layout.objects
    }

    fn support_surfaces(&self) -> &[SupportSurface] {
        &self.layout.supports
    }

    fn workspace(&self) -> PlanarBounds {
        self.layout.workspace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::kinematic::KinematicSim;
    use crate::task::TaskKind;
    use crate::test_support::{reference_scene, small_config, task_of_kind};

    #[test]
    fn same_task_rebuilds_the_same_world() {
        let config = small_config(16);
        let mut scene = reference_scene(&config);
        let task = task_of_kind(&config, TaskKind::PickAndPlace, 42);
        let first = scene.reset(&task).unwrap();
        let first_cameras = scene.cameras().to_vec();
        let second = scene.reset(&task).unwrap();
        assert_eq!(first, second);
        assert_eq!(first_cameras, scene.cameras());
        assert_eq!(second.timestamp(), 0);
    }

    #[test]
    fn placements_are_collision_free_and_in_workspace() {
        let config = small_config(16);
        let mut scene = reference_scene(&config);
        for seed in 0..40 {
            let task = task_of_kind(&config, TaskKind::Pick, seed);
            let state = scene.reset(&task).unwrap();
            let poses: Vec<(f64, f64, f64)> = config
                .scene
                .layout
                .objects
                .iter()
                .map(|o| {
                    let t = state.object_pose(&o.id).unwrap().translation;
                    (t.x, t.y, o.shape.footprint_radius())
                })
                .collect();
            for (i, a) in poses.iter().enumerate() {
                assert!(config.scene.layout.workspace.contains_disc(a.0, a.1, a.2));
                for b in &poses[i + 1..] {
                    assert!((a.0 - b.0).hypot(a.1 - b.1) >= a.2 + b.2);
                }
            }
        }
    }

    #[test]
    fn push_start_pose_is_honored() {
        let config = small_config(16);
        let mut scene = reference_scene(&config);
        let task = task_of_kind(&config, TaskKind::Push, 5);
        let state = scene.reset(&task).unwrap();
        let placed = state.object_pose(task.target_object_id()).unwrap();
        assert_eq!(placed, task.start_pose().unwrap());
    }

    #[test]
    fn crowded_workspace_is_infeasible() {
        let mut config = small_config(16);
        config.scene.layout.workspace = PlanarBounds::new(0.45, -0.05, 0.55, 0.05);
        config.sampler.only(TaskKind::Pick);
        let mut scene = reference_scene(&config);
        let task = task_of_kind(&config, TaskKind::Pick, 1);
        assert!(matches!(scene.reset(&task), Err(SceneError::Infeasible(_))));
    }

    #[test]
    fn step_clips_to_limits_and_delta() {
        let config = small_config(16);
        let mut scene = reference_scene(&config);
        scene.reset(&task_of_kind(&config, TaskKind::Pick, 3)).unwrap();
        let home = config.scene.robot.home.clone();

        let mut action = home.clone();
        action[0] += 1.0;
        action[1] -= 0.01;
        let (state, executed) = scene.step(&action).unwrap();
        assert!((executed[0] - (home[0] + 0.05)).abs() < 1e-12);
        assert!((executed[1] - (home[1] - 0.01)).abs() < 1e-12);
        assert_eq!(state.robot_joint_positions(), executed.as_slice());
        assert_eq!(state.timestamp(), 1);

        assert!(matches!(scene.step(&home[..3]), Err(SceneError::ActionDimension { expected: 9, got: 3 })));
        let mut nan = home;
        nan[4] = f64::NAN;
        assert!(matches!(scene.step(&nan), Err(SceneError::NonFiniteAction(4))));
    }

    #[test]
    fn observation_matches_camera_and_joint_shapes() {
        let config = small_config(128);
        let mut scene = reference_scene(&config);
        let state = scene.reset(&task_of_kind(&config, TaskKind::Pick, 9)).unwrap();
        let obs = scene.observe(&state).unwrap();
        assert_eq!(obs.step_index, 0);
        assert_eq!(obs.camera_images["front"].shape(), &[128, 128, 3]);
        assert_eq!(obs.proprioception.len(), 9);
        assert!(matches!(scene.render("wrist"), Err(SceneError::UnknownCamera(_))));
    }

    #[test]
    fn fresh_pick_is_not_yet_successful() {
        let config = small_config(16);
        let mut scene: SceneController<KinematicSim> = reference_scene(&config);
        let task = task_of_kind(&config, TaskKind::Pick, 2);
        scene.reset(&task).unwrap();
        assert!(!scene.query_success(&task));
    }
}
