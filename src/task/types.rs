//! Task kinds and the immutable [`Task`] value.
//!
//! Task kinds form a closed set. Each kind implements the same capability
//! set: a precondition on the target object, goal-pose computation validated
//! against scene geometry, instruction rendering from templates, and the
//! success predicate the scene evaluates.

use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::geometry::{distance, planar_distance, pose_at, PlanarBounds, Pose};
use crate::scene::layout::{ObjectSpec, SceneGeometry, SupportSurface, SurfaceKind};

// ---------------------------------------------------------------------------
// Task kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Grasp the object and lift it clear of the table.
    Pick,
    /// Grasp the object and set it down on a support surface.
    PickAndPlace,
    /// Slide the object across the table without grasping it.
    Push,
}

/// Parameters for goal computation, taken from the sampler config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalParams {
    pub lift_height: f64,
    pub push_distance: f64,
    pub place_margin: f64,
}

/// Goal pose plus any constraint the kind puts on the initial scene.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalSpec {
    pub goal_pose: Pose,
    pub start_pose: Option<Pose>,
    pub support: Option<String>,
    /// Extra words substituted into templates (`{support}`, `{direction}`).
    pub direction: Option<PushDirection>,
}

/// What the scene reports about the target when checking success.
#[derive(Debug, Clone, Copy)]
pub struct SuccessView<'a> {
    pub object_pose: &'a Pose,
    pub held: bool,
    pub in_contact: bool,
    pub tolerance: f64,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Pick, TaskKind::PickAndPlace, TaskKind::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pick => "pick",
            Self::PickAndPlace => "pick-and-place",
            Self::Push => "push",
        }
    }

    /// Parse from a string (case-insensitive, `-`/`_`/space tolerant).
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['_', ' '], "-").as_str() {
            "pick" | "pick-up" => Some(Self::Pick),
            "pick-and-place" | "place" => Some(Self::PickAndPlace),
            "push" => Some(Self::Push),
            _ => None,
        }
    }

    pub fn difficulty(&self) -> Difficulty {
        match self {
            Self::Pick => Difficulty::Easy,
            Self::Push => Difficulty::Medium,
            Self::PickAndPlace => Difficulty::Hard,
        }
    }

    /// Whether `object` can be the target of this kind at all.
    pub fn precondition(&self, object: &ObjectSpec) -> bool {
        match self {
            Self::Pick | Self::PickAndPlace => object.shape.is_liftable(),
            Self::Push => object.shape.is_pushable(),
        }
    }

    pub fn templates(&self) -> &'static [&'static str] {
        match self {
            Self::Pick => &[
                "Pick up the {color} {object}",
                "Grasp the {color} item",
                "Lift the {object}",
                "Retrieve the {color} {object}",
            ],
            Self::PickAndPlace => &[
                "Put the {color} {object} on the {support}",
                "Place the {color} item on the {support}",
                "Move the {object} onto the {support}",
            ],
            Self::Push => &[
                "Push the {color} {object} {direction}",
                "Slide the {color} item {direction}",
                "Nudge the {object} {direction}",
            ],
        }
    }

    /// Compute a goal for `object` that satisfies this kind's geometric
    /// constraints, or explain why none exists.
    pub fn compute_goal<G, R>(
        &self,
        object: &ObjectSpec,
        geometry: &G,
        params: &GoalParams,
        rng: &mut R,
    ) -> Result<GoalSpec, String>
    where
        G: SceneGeometry + ?Sized,
        R: Rng + ?Sized,
    {
        let table = geometry
            .support_surfaces()
            .iter()
            .find(|s| s.kind == SurfaceKind::Table)
            .ok_or_else(|| "scene has no table".to_string())?;
        let radius = object.shape.footprint_radius();
        let workspace = geometry.workspace();

        match self {
            Self::Pick => {
                let [cx, cy] = workspace.center();
                Ok(GoalSpec {
                    goal_pose: pose_at(cx, cy, object.rest_height(table.top) + params.lift_height),
                    start_pose: None,
                    support: None,
                    direction: None,
                })
            }
            Self::PickAndPlace => {
                let candidates: Vec<(&SupportSurface, PlanarBounds)> = geometry
                    .support_surfaces()
                    .iter()
                    .filter_map(|s| {
                        let region = match s.kind {
                            // Table goals stay inside the reachable workspace.
                            SurfaceKind::Table => intersect(&s.bounds, &workspace)?,
                            SurfaceKind::Fixture => s.bounds,
                        };
                        region.shrink(radius + params.place_margin).map(|r| (s, r))
                    })
                    .collect();
                let (surface, region) = candidates
                    .choose(rng)
                    .ok_or_else(|| format!("no support surface fits `{}`", object.id))?;
                let x = rng.gen_range(region.min[0]..=region.max[0]);
                let y = rng.gen_range(region.min[1]..=region.max[1]);
                Ok(GoalSpec {
                    goal_pose: pose_at(x, y, object.rest_height(surface.top)),
                    start_pose: None,
                    support: Some(surface.name.clone()),
                    direction: None,
                })
            }
            Self::Push => {
                let region = workspace
                    .shrink(radius)
                    .ok_or_else(|| format!("workspace too small for `{}`", object.id))?;
                let direction = *PushDirection::ALL
                    .choose(rng)
                    .ok_or_else(|| "no push direction".to_string())?;
                let [dx, dy] = direction.unit();
                let d = params.push_distance;
                // Start positions whose pushed goal stays inside the region.
                let start_region = PlanarBounds::new(
                    region.min[0] - dx.min(0.0) * d,
                    region.min[1] - dy.min(0.0) * d,
                    region.max[0] - dx.max(0.0) * d,
                    region.max[1] - dy.max(0.0) * d,
                );
                if start_region.min[0] > start_region.max[0] || start_region.min[1] > start_region.max[1] {
                    return Err(format!(
                        "cannot push `{}` {} by {d:.3} m inside the workspace",
                        object.id,
                        direction.phrase()
                    ));
                }
                let sx = rng.gen_range(start_region.min[0]..=start_region.max[0]);
                let sy = rng.gen_range(start_region.min[1]..=start_region.max[1]);
                let z = object.rest_height(table.top);
                Ok(GoalSpec {
                    goal_pose: pose_at(sx + dx * d, sy + dy * d, z),
                    start_pose: Some(pose_at(sx, sy, z)),
                    support: None,
                    direction: Some(direction),
                })
            }
        }
    }

    /// Success predicate evaluated against the target's current state.
    pub fn is_satisfied(&self, goal: &Pose, view: &SuccessView<'_>) -> bool {
        match self {
            Self::Pick => {
                view.held
                    && view.object_pose.translation.vector.z >= goal.translation.vector.z - view.tolerance
            }
            Self::PickAndPlace => {
                !view.held && !view.in_contact && distance(view.object_pose, goal) <= view.tolerance
            }
            Self::Push => !view.held && planar_distance(view.object_pose, goal) <= view.tolerance,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

fn intersect(a: &PlanarBounds, b: &PlanarBounds) -> Option<PlanarBounds> {
    let r = PlanarBounds::new(
        a.min[0].max(b.min[0]),
        a.min[1].max(b.min[1]),
        a.max[0].min(b.max[0]),
        a.max[1].min(b.max[1]),
    );
    (r.min[0] <= r.max[0] && r.min[1] <= r.max[1]).then_some(r)
}

// ---------------------------------------------------------------------------
// Push direction
// ---------------------------------------------------------------------------

/// Push directions as seen from the robot base looking down +x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushDirection {
    Left,
    Right,
    Forward,
    Backward,
}

impl PushDirection {
    pub const ALL: [PushDirection; 4] = [Self::Left, Self::Right, Self::Forward, Self::Backward];

    /// Unit vector `[x, y]` in the world frame.
    pub fn unit(&self) -> [f64; 2] {
        match self {
            Self::Left => [0.0, 1.0],
            Self::Right => [0.0, -1.0],
            Self::Forward => [1.0, 0.0],
            Self::Backward => [-1.0, 0.0],
        }
    }

    pub fn phrase(&self) -> &'static str {
        match self {
            Self::Left => "to the left",
            Self::Right => "to the right",
            Self::Forward => "away from the robot",
            Self::Backward => "toward the robot",
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Difficulty and free-form labels attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTags {
    pub difficulty: Difficulty,
    pub labels: Vec<String>,
}

/// A sampled manipulation task. Immutable once sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    instruction: String,
    kind: TaskKind,
    target_object_id: String,
    goal_pose: Pose,
    start_pose: Option<Pose>,
    support: Option<String>,
    direction: Option<PushDirection>,
    tags: TaskTags,
    seed: u64,
}

impl Task {
    pub(crate) fn new(
        instruction: String,
        kind: TaskKind,
        object: &ObjectSpec,
        goal: GoalSpec,
        seed: u64,
    ) -> Self {
        let mut labels = vec![
            kind.as_str().to_string(),
            object.shape.as_str().to_string(),
            object.color.as_str().to_string(),
        ];
        labels.extend(goal.support.iter().cloned());
        Self {
            instruction,
            kind,
            target_object_id: object.id.clone(),
            goal_pose: goal.goal_pose,
            start_pose: goal.start_pose,
            support: goal.support,
            direction: goal.direction,
            tags: TaskTags {
                difficulty: kind.difficulty(),
                labels,
            },
            seed,
        }
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn target_object_id(&self) -> &str {
        &self.target_object_id
    }

    pub fn goal_pose(&self) -> &Pose {
        &self.goal_pose
    }

    /// Initial pose of the target imposed by the task (push tasks only).
    pub fn start_pose(&self) -> Option<&Pose> {
        self.start_pose.as_ref()
    }

    /// Name of the support surface the goal rests on (pick-and-place only).
    pub fn support(&self) -> Option<&str> {
        self.support.as_deref()
    }

    pub fn direction(&self) -> Option<PushDirection> {
        self.direction
    }

    pub fn tags(&self) -> &TaskTags {
        &self.tags
    }

    /// The seed this task was sampled from; scene randomization derives from it.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// Fill a template for `object`. Unknown placeholders are left untouched.
pub fn render_instruction(template: &str, object: &ObjectSpec, goal: &GoalSpec) -> String {
    let mut text = template
        .replace("{color}", object.color.as_str())
        .replace("{object}", object.shape.as_str());
    if let Some(support) = &goal.support {
        text = text.replace("{support}", support);
    }
    if let Some(direction) = goal.direction {
        text = text.replace("{direction}", direction.phrase());
    }
    text
}

/// A template is usable only if it identifies `object` uniquely among `objects`.
pub fn template_identifies(template: &str, object: &ObjectSpec, objects: &[ObjectSpec]) -> bool {
    let names_color = template.contains("{color}");
    let names_shape = template.contains("{object}");
    objects.iter().filter(|o| o.id != object.id).all(|other| {
        let color_clash = !names_color || other.color == object.color;
        let shape_clash = !names_shape || other.shape == object.shape;
        !(color_clash && shape_clash)
    })
}
