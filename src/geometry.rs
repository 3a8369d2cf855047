//! Pose and planar-region helpers shared by the sampler, scene and planner.

use nalgebra::{Isometry3, Vector3};
use serde::{Deserialize, Serialize};

/// A rigid 6-DoF transform in the world frame (metres, radians).
pub type Pose = Isometry3<f64>;

/// Pose at `(x, y, z)` with identity orientation.
#[must_use]
pub fn pose_at(x: f64, y: f64, z: f64) -> Pose {
    Isometry3::translation(x, y, z)
}

/// Pose at `(x, y, z)` rotated by `yaw` about the world z axis.
#[must_use]
pub fn pose_at_yaw(x: f64, y: f64, z: f64, yaw: f64) -> Pose {
    Isometry3::new(Vector3::new(x, y, z), Vector3::z() * yaw)
}

/// Horizontal distance between the origins of two poses.
#[must_use]
pub fn planar_distance(a: &Pose, b: &Pose) -> f64 {
    let d = a.translation.vector - b.translation.vector;
    d.x.hypot(d.y)
}

/// Full 3-D distance between the origins of two poses.
#[must_use]
pub fn distance(a: &Pose, b: &Pose) -> f64 {
    (a.translation.vector - b.translation.vector).norm()
}

/// An axis-aligned rectangle in the horizontal plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanarBounds {
    /// `[x, y]` of the lower corner.
    pub min: [f64; 2],
    /// `[x, y]` of the upper corner.
    pub max: [f64; 2],
}

impl PlanarBounds {
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min: [min_x, min_y],
            max: [max_x, max_y],
        }
    }

    /// Rectangle of the given size centred on `(cx, cy)`.
    pub fn centered(cx: f64, cy: f64, size_x: f64, size_y: f64) -> Self {
        Self::new(
            cx - size_x / 2.0,
            cy - size_y / 2.0,
            cx + size_x / 2.0,
            cy + size_y / 2.0,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.min.iter().chain(&self.max).all(|v| v.is_finite())
            && self.min[0] < self.max[0]
            && self.min[1] < self.max[1]
    }

    pub fn center(&self) -> [f64; 2] {
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
        ]
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min[0] && x <= self.max[0] && y >= self.min[1] && y <= self.max[1]
    }

    /// Whether a disc of radius `r` centred at `(x, y)` lies entirely inside.
    pub fn contains_disc(&self, x: f64, y: f64, r: f64) -> bool {
        x - r >= self.min[0] && x + r <= self.max[0] && y - r >= self.min[1] && y + r <= self.max[1]
    }

    /// Whether a disc of radius `r` centred at `(x, y)` touches the rectangle.
    pub fn intersects_disc(&self, x: f64, y: f64, r: f64) -> bool {
        let nx = x.clamp(self.min[0], self.max[0]);
        let ny = y.clamp(self.min[1], self.max[1]);
        (x - nx).hypot(y - ny) < r
    }

    /// The rectangle inset by `margin` on every side, or `None` if nothing is left.
    pub fn shrink(&self, margin: f64) -> Option<Self> {
        let inner = Self::new(
            self.min[0] + margin,
            self.min[1] + margin,
            self.max[0] - margin,
            self.max[1] - margin,
        );
        (inner.min[0] <= inner.max[0] && inner.min[1] <= inner.max[1]).then_some(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn disc_containment_respects_radius() {
        let b = PlanarBounds::new(0.0, 0.0, 1.0, 1.0);
        assert!(b.contains_disc(0.5, 0.5, 0.2));
        assert!(!b.contains_disc(0.1, 0.5, 0.2));
        assert!(b.intersects_disc(1.1, 0.5, 0.2));
        assert!(!b.intersects_disc(1.3, 0.5, 0.2));
    }

    #[test]
    fn shrink_collapses_to_none() {
        let b = PlanarBounds::centered(0.0, 0.0, 0.1, 0.1);
        assert!(b.shrink(0.04).is_some());
        assert!(b.shrink(0.06).is_none());
    }

    #[test]
    fn distances_ignore_orientation() {
        let a = pose_at_yaw(0.0, 0.0, 0.0, 1.0);
        let b = pose_at(3.0, 4.0, 12.0);
        assert_relative_eq!(planar_distance(&a, &b), 5.0, epsilon = 1e-12);
        assert_relative_eq!(distance(&a, &b), 13.0, epsilon = 1e-12);
    }
}
