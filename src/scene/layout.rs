//! Static scene description: manipulable objects, support surfaces and the
//! workspace, plus the built-in asset and colour tables.

use serde::{Deserialize, Serialize};

use crate::geometry::PlanarBounds;

// ---------------------------------------------------------------------------
// Asset table
// ---------------------------------------------------------------------------

/// The primitive shapes the scene can spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Shape {
    /// 4 cm cube.
    Cube,
    /// 3 cm radius sphere.
    Sphere,
    /// Cylinder, 4 cm radius and 8 cm tall.
    Mug,
}

impl Shape {
    pub const ALL: [Shape; 3] = [Shape::Cube, Shape::Sphere, Shape::Mug];

    /// Noun used in instructions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cube => "cube",
            Self::Sphere => "sphere",
            Self::Mug => "mug",
        }
    }

    /// Half of the vertical extent; an object resting on a surface has its
    /// centre this far above the surface.
    pub fn half_height(&self) -> f64 {
        match self {
            Self::Cube => 0.02,
            Self::Sphere => 0.03,
            Self::Mug => 0.04,
        }
    }

    /// Radius of the smallest disc covering the horizontal footprint.
    pub fn footprint_radius(&self) -> f64 {
        match self {
            Self::Cube => 0.02 * std::f64::consts::SQRT_2,
            Self::Sphere => 0.03,
            Self::Mug => 0.04,
        }
    }

    /// Finger opening at which a closing gripper makes contact.
    pub fn grip_width(&self) -> f64 {
        match self {
            Self::Cube => 0.04,
            Self::Sphere => 0.06,
            Self::Mug => 0.08,
        }
    }

    pub fn is_liftable(&self) -> bool {
        true
    }

    /// Spheres roll away from a pusher instead of sliding predictably.
    pub fn is_pushable(&self) -> bool {
        !matches!(self, Self::Sphere)
    }
}

// ---------------------------------------------------------------------------
// Colour table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Green,
    Blue,
    Yellow,
    Cyan,
    Magenta,
    White,
    Black,
}

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
            Self::Yellow => "yellow",
            Self::Cyan => "cyan",
            Self::Magenta => "magenta",
            Self::White => "white",
            Self::Black => "black",
        }
    }

    /// Linear RGB in `[0, 1]`.
    pub fn rgb(&self) -> [f64; 3] {
        match self {
            Self::Red => [1.0, 0.0, 0.0],
            Self::Green => [0.0, 1.0, 0.0],
            Self::Blue => [0.0, 0.0, 1.0],
            Self::Yellow => [1.0, 1.0, 0.0],
            Self::Cyan => [0.0, 1.0, 1.0],
            Self::Magenta => [1.0, 0.0, 1.0],
            Self::White => [1.0, 1.0, 1.0],
            Self::Black => [0.0, 0.0, 0.0],
        }
    }
}

// ---------------------------------------------------------------------------
// Scene contents
// ---------------------------------------------------------------------------

/// A manipulable object present in every episode of the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    /// Unique identifier (e.g. `"red_cube"`).
    pub id: String,
    pub shape: Shape,
    pub color: Color,
}

impl ObjectSpec {
    pub fn new(shape: Shape, color: Color) -> Self {
        Self {
            id: format!("{}_{}", color.as_str(), shape.as_str()),
            shape,
            color,
        }
    }

    /// Height of the object's centre when resting on a surface at `surface_top`.
    pub fn rest_height(&self, surface_top: f64) -> f64 {
        surface_top + self.shape.half_height()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    /// The ground plane objects start on.
    Table,
    /// A raised fixture standing on the table (tray, plate, ...).
    Fixture,
}

/// A horizontal surface objects can rest on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportSurface {
    pub name: String,
    pub kind: SurfaceKind,
    pub bounds: PlanarBounds,
    /// Height of the top face.
    pub top: f64,
    /// Render colour.
    pub color: [f64; 3],
}

/// Everything static about a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneLayout {
    /// Region of the table where objects are spawned and pushed.
    pub workspace: PlanarBounds,
    pub supports: Vec<SupportSurface>,
    pub objects: Vec<ObjectSpec>,
    /// Objects may not be placed closer than this to the robot base at the origin.
    pub robot_base_clearance: f64,
}

impl Default for SceneLayout {
    fn default() -> Self {
        Self {
            workspace: PlanarBounds::new(0.3, -0.2, 0.7, 0.2),
            supports: vec![
                SupportSurface {
                    name: "table".into(),
                    kind: SurfaceKind::Table,
                    bounds: PlanarBounds::new(0.0, -0.5, 1.0, 0.5),
                    top: 0.0,
                    color: [0.55, 0.42, 0.3],
                },
                SupportSurface {
                    name: "tray".into(),
                    kind: SurfaceKind::Fixture,
                    bounds: PlanarBounds::centered(0.5, 0.33, 0.16, 0.12),
                    top: 0.02,
                    color: [0.75, 0.75, 0.78],
                },
            ],
            objects: vec![
                ObjectSpec::new(Shape::Cube, Color::Red),
                ObjectSpec::new(Shape::Sphere, Color::Green),
                ObjectSpec::new(Shape::Mug, Color::Blue),
            ],
            robot_base_clearance: 0.25,
        }
    }
}

impl SceneLayout {
    pub fn object(&self, id: &str) -> Option<&ObjectSpec> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn table(&self) -> Option<&SupportSurface> {
        self.supports.iter().find(|s| s.kind == SurfaceKind::Table)
    }

    pub fn fixtures(&self) -> impl Iterator<Item = &SupportSurface> {
        self.supports.iter().filter(|s| s.kind == SurfaceKind::Fixture)
    }

    /// Top of the highest support under `(x, y)`, falling back to the table.
    pub fn surface_height_at(&self, x: f64, y: f64) -> f64 {
        let table_top = self.table().map_or(0.0, |t| t.top);
        self.fixtures()
            .filter(|s| s.bounds.contains(x, y))
            .map(|s| s.top)
            .fold(table_top, f64::max)
    }

    /// Structural checks: one table, unique object ids, sane bounds.
    pub fn validate(&self) -> Result<(), String> {
        if !self.workspace.is_valid() {
            return Err("workspace bounds are empty or non-finite".into());
        }
        let tables = self
            .supports
            .iter()
            .filter(|s| s.kind == SurfaceKind::Table)
            .count();
        if tables != 1 {
            return Err(format!("expected exactly one table surface, found {tables}"));
        }
        for s in &self.supports {
            if !s.bounds.is_valid() {
                return Err(format!("support `{}` has invalid bounds", s.name));
            }
        }
        let mut ids: Vec<&str> = self.objects.iter().map(|o| o.id.as_str()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err("object ids must be unique".into());
        }
        Ok(())
    }
}

/// Geometry queries the task sampler validates goals against.
pub trait SceneGeometry {
    fn manipulable_objects(&self) -> &[ObjectSpec];
    fn support_surfaces(&self) -> &[SupportSurface];
    fn workspace(&self) -> PlanarBounds;
}

impl SceneGeometry for SceneLayout {
    fn manipulable_objects(&self) -> &[ObjectSpec] {
        &self.objects
    }

    fn support_surfaces(&self) -> &[SupportSurface] {
        &self.supports
    }

    fn workspace(&self) -> PlanarBounds {
        self.workspace
    }
}
