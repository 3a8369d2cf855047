use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scene::layout::SceneLayout;
use crate::scene::traits::{CameraSpec, RobotSpec};
use crate::task::types::{GoalParams, TaskKind};

/// Complete configuration for the episode synthesis pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub episode: EpisodeConfig,
    pub sampler: SamplerConfig,
    pub scene: SceneConfig,
    pub planner: PlannerConfig,
    pub archive: ArchiveConfig,
    pub run: RunConfig,
}

/// Per-episode execution budget and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeConfig {
    /// Step budget before the episode ends as a timeout (default: 500).
    pub max_steps: usize,
    /// Stop as soon as the task is satisfied (default: true).
    pub early_termination: bool,
    /// Resamples allowed after an infeasible task (default: 8).
    pub max_sample_retries: u32,
    /// Attempts allowed when the scene cannot be reset (default: 3).
    pub max_reset_attempts: u32,
}

/// Task distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Relative weight per task kind. Kinds not listed are never drawn.
    pub task_weights: BTreeMap<TaskKind, f64>,
    /// Relative weight per object id. Objects not listed default to 1.0.
    pub object_weights: BTreeMap<String, f64>,
    /// Height above rest a pick must reach, in metres (default: 0.1).
    pub lift_height: f64,
    /// Distance a push must move the object, in metres (default: 0.1).
    pub push_distance: f64,
    /// Extra margin between a placed footprint and the support edge (default: 0.005).
    pub place_margin: f64,
}

/// Scene contents, robot, cameras and reset randomization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub layout: SceneLayout,
    pub robot: RobotSpec,
    pub cameras: Vec<CameraSpec>,
    pub randomization: RandomizationConfig,
    pub placement: PlacementConfig,
    pub success: SuccessConfig,
}

/// Domain randomization applied at every reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizationConfig {
    /// Uniform noise on each camera position axis, in metres (default: 0.05).
    pub camera_position_noise: f64,
    /// Uniform noise on each camera look-at axis, in metres (default: 0.02).
    pub camera_look_at_noise: f64,
    pub light_position_min: [f64; 3],
    pub light_position_max: [f64; 3],
    pub light_intensity_min: f64,
    pub light_intensity_max: f64,
    /// Randomize object yaw (default: true).
    pub object_yaw: bool,
}

/// Rejection sampling of initial object poses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Minimum gap between footprints, in metres (default: 0.02).
    pub clearance: f64,
    /// Draws per object before the reset is declared infeasible (default: 100).
    pub max_tries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessConfig {
    /// Position tolerance of the success predicates, in metres (default: 0.02).
    pub position_tolerance: f64,
}

/// Keyframe planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Interpolation steps per arm segment (default: 50).
    pub segment_steps: usize,
    /// Interpolation steps for opening or closing the gripper (default: 20).
    pub gripper_steps: usize,
    /// Hover height above grasp and place points (default: 0.1).
    pub approach_height: f64,
    /// Per-finger opening when open (default: 0.05).
    pub gripper_open: f64,
    /// Per-finger opening when closed (default: 0.0).
    pub gripper_closed: f64,
    /// Largest arm joint error against the previous target before tracking
    /// is declared diverged (default: 0.05).
    pub tracking_tolerance: f64,
    /// Gap left between the pusher and the object before a push (default: 0.02).
    pub push_standoff: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Dataset root directory (default: `data/vla_dataset`).
    pub output_dir: PathBuf,
}

/// Generation run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of seeds to generate (default: 1000).
    pub num_episodes: u64,
    /// First seed of the run (default: 0).
    pub seed_start: u64,
    /// Parallel workers, each with its own engine (default: 1).
    pub workers: usize,
    /// Fraction of successful episodes below which the run reports failure
    /// (default: 0.0).
    pub min_success_fraction: f64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            max_steps: 500,
            early_termination: true,
            max_sample_retries: 8,
            max_reset_attempts: 3,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            task_weights: TaskKind::ALL.iter().map(|k| (*k, 1.0)).collect(),
            object_weights: BTreeMap::new(),
            lift_height: 0.1,
            push_distance: 0.1,
            place_margin: 0.005,
        }
    }
}

impl Default for RandomizationConfig {
    fn default() -> Self {
        Self {
            camera_position_noise: 0.05,
            camera_look_at_noise: 0.02,
            light_position_min: [1.0, -1.0, 2.0],
            light_position_max: [2.0, 1.0, 3.0],
            light_intensity_min: 1.0,
            light_intensity_max: 3.0,
            object_yaw: true,
        }
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            clearance: 0.02,
            max_tries: 100,
        }
    }
}

impl Default for SuccessConfig {
    fn default() -> Self {
        Self {
            position_tolerance: 0.02,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            segment_steps: 50,
            gripper_steps: 20,
            approach_height: 0.1,
            gripper_open: 0.05,
            gripper_closed: 0.0,
            tracking_tolerance: 0.05,
            push_standoff: 0.02,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data/vla_dataset"),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_episodes: 1000,
            seed_start: 0,
            workers: 1,
            min_success_fraction: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl SynthesisConfig {
    /// Load a JSON config. Missing sections and fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Cameras actually used: the configured list, or the default front camera.
    pub fn cameras(&self) -> Vec<CameraSpec> {
        if self.scene.cameras.is_empty() {
            vec![CameraSpec::default()]
        } else {
            self.scene.cameras.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.episode.max_steps == 0 {
            return Err(ConfigError::invalid("episode.max_steps", "must be > 0"));
        }
        if self.episode.max_reset_attempts == 0 {
            return Err(ConfigError::invalid("episode.max_reset_attempts", "must be > 0"));
        }

        let s = &self.sampler;
        if s.task_weights.values().chain(s.object_weights.values()).any(|w| !(*w >= 0.0) || !w.is_finite()) {
            return Err(ConfigError::invalid("sampler", "weights must be finite and >= 0"));
        }
        if !s.task_weights.values().any(|w| *w > 0.0) {
            return Err(ConfigError::invalid("sampler.task_weights", "at least one kind needs a positive weight"));
        }
        for (name, v) in [
            ("sampler.lift_height", s.lift_height),
            ("sampler.push_distance", s.push_distance),
        ] {
            if !(v > 0.0) {
                return Err(ConfigError::invalid(name, "must be > 0"));
            }
        }

        self.scene
            .layout
            .validate()
            .map_err(|m| ConfigError::invalid("scene.layout", m))?;
        self.scene
            .robot
            .validate()
            .map_err(|m| ConfigError::invalid("scene.robot", m))?;
        let mut names: Vec<String> = Vec::new();
        for cam in self.cameras() {
            if cam.width == 0 || cam.height == 0 {
                return Err(ConfigError::invalid("scene.cameras", format!("camera `{}` has a zero dimension", cam.name)));
            }
            if !(cam.fov_deg > 0.0 && cam.fov_deg < 180.0) {
                return Err(ConfigError::invalid("scene.cameras", format!("camera `{}` fov must be in (0, 180)", cam.name)));
            }
            if names.contains(&cam.name) {
                return Err(ConfigError::invalid("scene.cameras", format!("duplicate camera `{}`", cam.name)));
            }
            names.push(cam.name);
        }
        let r = &self.scene.randomization;
        if r.light_intensity_min > r.light_intensity_max
            || (0..3).any(|i| r.light_position_min[i] > r.light_position_max[i])
        {
            return Err(ConfigError::invalid("scene.randomization", "light ranges must have min <= max"));
        }
        if r.camera_position_noise < 0.0 || r.camera_look_at_noise < 0.0 {
            return Err(ConfigError::invalid("scene.randomization", "noise must be >= 0"));
        }
        if self.scene.placement.max_tries == 0 {
            return Err(ConfigError::invalid("scene.placement.max_tries", "must be > 0"));
        }
        if !(self.scene.success.position_tolerance > 0.0) {
            return Err(ConfigError::invalid("scene.success.position_tolerance", "must be > 0"));
        }

        let p = &self.planner;
        if p.segment_steps == 0 || p.gripper_steps == 0 {
            return Err(ConfigError::invalid("planner", "segment and gripper steps must be > 0"));
        }
        if !(p.tracking_tolerance > 0.0) {
            return Err(ConfigError::invalid("planner.tracking_tolerance", "must be > 0"));
        }

        if self.run.workers == 0 {
            return Err(ConfigError::invalid("run.workers", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.run.min_success_fraction) {
            return Err(ConfigError::invalid("run.min_success_fraction", "must be in [0, 1]"));
        }
        Ok(())
    }
}

impl SamplerConfig {
    /// Restrict the distribution to a single kind.
    pub fn only(&mut self, kind: TaskKind) {
        self.task_weights = BTreeMap::from([(kind, 1.0)]);
    }

    pub fn goal_params(&self) -> GoalParams {
        GoalParams {
            lift_height: self.lift_height,
            push_distance: self.push_distance,
            place_margin: self.place_margin,
        }
    }

    /// Weight of an object id; unlisted objects weigh 1.0.
    pub fn object_weight(&self, id: &str) -> f64 {
        self.object_weights.get(id).copied().unwrap_or(1.0)
    }
}
