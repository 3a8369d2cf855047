//! Deterministic kinematic reference engine.
//!
//! A Cartesian gantry carries the tool centre point directly on its first
//! three joints; the wrist yaw joint orients the tool. There are no
//! dynamics: joints reach their targets every tick, a closing gripper
//! attaches the nearest object within reach, an opening gripper drops it onto
//! the surface below, and a tool moving sideways into an object shoves it
//! along. Frames come from a small pinhole rasterizer.

use std::collections::BTreeMap;

use nalgebra::{Translation3, UnitQuaternion, Vector3};

use crate::array::NdArray;
use crate::error::EngineError;
use crate::geometry::{planar_distance, Pose};

use super::layout::{ObjectSpec, SupportSurface};
use super::traits::{CameraSpec, Lighting, RobotSpec, SimEngine, WorldSetup};

/// Radius of the tool tip when it touches objects.
pub const PUSHER_RADIUS: f64 = 0.01;
/// Largest distance between tool tip and object centre that still grasps.
pub const GRASP_TOLERANCE: f64 = 0.02;
/// Opening beyond the grip width at which a held object is released.
const RELEASE_MARGIN: f64 = 0.005;
const CONTACT_EPS: f64 = 1e-6;

const JOINT_X: usize = 0;
const JOINT_Y: usize = 1;
const JOINT_Z: usize = 2;
const JOINT_YAW: usize = 5;

/// Tool pose of the gantry for a joint vector.
pub fn gantry_end_effector(joints: &[f64]) -> Pose {
    let at = |i: usize| joints.get(i).copied().unwrap_or(0.0);
    Pose::from_parts(
        Translation3::new(at(JOINT_X), at(JOINT_Y), at(JOINT_Z)),
        UnitQuaternion::from_euler_angles(0.0, 0.0, at(JOINT_YAW)),
    )
}

#[derive(Debug, Clone)]
struct SimObject {
    spec: ObjectSpec,
    pose: Pose,
}

#[derive(Debug, Clone)]
struct Grasp {
    id: String,
    /// Object pose in the tool frame.
    offset: Pose,
}

#[derive(Debug, Clone)]
pub struct KinematicSim {
    robot: RobotSpec,
    joints: Vec<f64>,
    objects: BTreeMap<String, SimObject>,
    supports: Vec<SupportSurface>,
    lighting: Lighting,
    grasp: Option<Grasp>,
    ready: bool,
}

impl KinematicSim {
    pub fn new(robot: RobotSpec) -> Self {
        Self {
            joints: robot.home.clone(),
            robot,
            objects: BTreeMap::new(),
            supports: Vec::new(),
            lighting: Lighting::default(),
            grasp: None,
            ready: false,
        }
    }

    fn gripper_opening(&self) -> f64 {
        self.joints[self.robot.first_finger()..].iter().sum()
    }

    fn surface_top_at(&self, x: f64, y: f64) -> f64 {
        self.supports
            .iter()
            .filter(|s| s.bounds.contains(x, y))
            .map(|s| s.top)
            .fold(0.0, f64::max)
    }

    fn settle(&mut self, id: &str) {
        let Some(top) = self
            .objects
            .get(id)
            .map(|o| self.surface_top_at(o.pose.translation.x, o.pose.translation.y))
        else {
            return;
        };
        if let Some(object) = self.objects.get_mut(id) {
            let t = object.pose.translation;
            let (_, _, yaw) = object.pose.rotation.euler_angles();
            object.pose = Pose::from_parts(
                Translation3::new(t.x, t.y, object.spec.rest_height(top)),
                UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
            );
        }
    }

    fn update_grasp(&mut self) {
        let ee = gantry_end_effector(&self.joints);
        let opening = self.gripper_opening();
        let first_finger = self.robot.first_finger();
        let fingers = self.robot.finger_joints.max(1) as f64;

        if let Some(grasp) = self.grasp.clone() {
            let width = self.objects.get(&grasp.id).map_or(0.0, |o| o.spec.shape.grip_width());
            if opening > width + RELEASE_MARGIN {
                self.grasp = None;
                self.settle(&grasp.id);
                return;
            }
            for q in &mut self.joints[first_finger..] {
                *q = q.max(width / fingers);
            }
            if let Some(object) = self.objects.get_mut(&grasp.id) {
                object.pose = ee * grasp.offset;
            }
            return;
        }

        let candidate = self
            .objects
            .values()
            .map(|o| ((o.pose.translation.vector - ee.translation.vector).norm(), o))
            .filter(|(d, o)| *d <= GRASP_TOLERANCE && opening <= o.spec.shape.grip_width() + CONTACT_EPS)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, o)| (o.spec.id.clone(), o.spec.shape.grip_width(), ee.inverse() * o.pose));
        if let Some((id, width, offset)) = candidate {
            for q in &mut self.joints[first_finger..] {
                *q = q.max(width / fingers);
            }
            self.grasp = Some(Grasp { id, offset });
        }
    }

    fn push_objects(&mut self, before: &Pose) {
        let ee = gantry_end_effector(&self.joints);
        let held = self.grasp.as_ref().map(|g| g.id.clone());
        for object in self.objects.values_mut() {
            if held.as_deref() == Some(object.spec.id.as_str()) {
                continue;
            }
            let half = object.spec.shape.half_height();
            let z = object.pose.translation.z;
            // Only lateral approaches push; descending onto an object does not.
            if (ee.translation.z - z).abs() > half || (before.translation.z - z).abs() > half {
                continue;
            }
            let contact = object.spec.shape.footprint_radius() + PUSHER_RADIUS;
            let now = planar_distance(&ee, &object.pose);
            let was = planar_distance(before, &object.pose);
            if now >= contact || was < contact - CONTACT_EPS {
                continue;
            }
            let mut away = Vector3::new(
                object.pose.translation.x - ee.translation.x,
                object.pose.translation.y - ee.translation.y,
                0.0,
            );
            if away.norm() < CONTACT_EPS {
                away = ee.translation.vector - before.translation.vector;
                away.z = 0.0;
            }
            let Some(dir) = away.try_normalize(CONTACT_EPS) else {
                continue;
            };
            object.pose.translation.x = ee.translation.x + dir.x * contact;
            object.pose.translation.y = ee.translation.y + dir.y * contact;
        }
    }
}

impl SimEngine for KinematicSim {
    fn reset(&mut self, setup: &WorldSetup) -> Result<(), EngineError> {
        if setup.robot_joints.len() != self.robot.joint_count() {
            return Err(EngineError::Reset(format!(
                "expected {} joints, setup has {}",
                self.robot.joint_count(),
                setup.robot_joints.len()
            )));
        }
        self.joints = setup.robot_joints.clone();
        self.objects = setup
            .objects
            .iter()
            .map(|p| {
                (
                    p.spec.id.clone(),
                    SimObject {
                        spec: p.spec.clone(),
                        pose: p.pose,
                    },
                )
            })
            .collect();
        self.supports = setup.supports.clone();
        self.lighting = setup.lighting;
        self.grasp = None;
        self.ready = true;
        Ok(())
    }

    fn step(&mut self, joint_targets: &[f64]) -> Result<(), EngineError> {
        if !self.ready {
            return Err(EngineError::Step("step before reset".into()));
        }
        if joint_targets.len() != self.joints.len() {
            return Err(EngineError::Step(format!(
                "expected {} targets, got {}",
                self.joints.len(),
                joint_targets.len()
            )));
        }
        if let Some(i) = joint_targets.iter().position(|q| !q.is_finite()) {
            return Err(EngineError::Step(format!("non-finite target for joint {i}")));
        }
        let before = gantry_end_effector(&self.joints);
        for (i, (q, target)) in self.joints.iter_mut().zip(joint_targets).enumerate() {
            *q = target.clamp(self.robot.lower[i], self.robot.upper[i]);
        }
        self.update_grasp();
        self.push_objects(&before);
        Ok(())
    }

    fn render(&self, camera: &CameraSpec) -> Result<NdArray, EngineError> {
        let image = Rasterizer::new(camera, &self.lighting)
            .ok_or_else(|| EngineError::Render(format!("camera `{}` has a degenerate view", camera.name)))?
            .draw(&self.supports, self.objects.values().map(|o| (&o.spec, &o.pose)), &gantry_end_effector(&self.joints));
        NdArray::from_u8(camera.frame_shape(), image).map_err(|e| EngineError::Render(e.to_string()))
    }

    fn joint_positions(&self) -> Vec<f64> {
        self.joints.clone()
    }

    fn end_effector_pose(&self) -> Pose {
        gantry_end_effector(&self.joints)
    }

    fn object_pose(&self, id: &str) -> Option<Pose> {
        self.objects.get(id).map(|o| o.pose)
    }

    fn held_object(&self) -> Option<String> {
        self.grasp.as_ref().map(|g| g.id.clone())
    }

    fn in_contact(&self, id: &str) -> bool {
        if self.grasp.as_ref().is_some_and(|g| g.id == id) {
            return true;
        }
        let Some(object) = self.objects.get(id) else {
            return false;
        };
        let ee = gantry_end_effector(&self.joints);
        let contact = object.spec.shape.footprint_radius() + PUSHER_RADIUS;
        planar_distance(&ee, &object.pose) <= contact + CONTACT_EPS
            && (ee.translation.z - object.pose.translation.z).abs() <= object.spec.shape.half_height() + CONTACT_EPS
    }
}

// ---------------------------------------------------------------------------
// Rasterizer
// ---------------------------------------------------------------------------

const SKY: [f64; 3] = [0.62, 0.7, 0.8];
const TOOL_COLOR: [f64; 3] = [0.2, 0.2, 0.22];

/// Pinhole projection plus painter's-order filling of quads and discs.
struct Rasterizer {
    width: usize,
    height: usize,
    eye: Vector3<f64>,
    forward: Vector3<f64>,
    right: Vector3<f64>,
    up: Vector3<f64>,
    focal: f64,
    brightness: f64,
}

impl Rasterizer {
    fn new(camera: &CameraSpec, lighting: &Lighting) -> Option<Self> {
        let eye = Vector3::from(camera.position);
        let forward = (Vector3::from(camera.look_at) - eye).try_normalize(1e-9)?;
        let right = forward.cross(&Vector3::z()).try_normalize(1e-9)?;
        let up = right.cross(&forward);
        let focal = camera.height as f64 / 2.0 / (camera.fov_deg.to_radians() / 2.0).tan();
        Some(Self {
            width: camera.width,
            height: camera.height,
            eye,
            forward,
            right,
            up,
            focal,
            brightness: (0.35 + 0.25 * lighting.intensity).clamp(0.2, 1.2),
        })
    }

    /// Pixel coordinates and depth of a world point in front of the camera.
    fn project(&self, p: Vector3<f64>) -> Option<(f64, f64, f64)> {
        let d = p - self.eye;
        let depth = d.dot(&self.forward);
        if depth <= 1e-3 {
            return None;
        }
        let u = self.width as f64 / 2.0 + self.focal * d.dot(&self.right) / depth;
        let v = self.height as f64 / 2.0 - self.focal * d.dot(&self.up) / depth;
        Some((u, v, depth))
    }

    fn shade(&self, rgb: [f64; 3]) -> [u8; 3] {
        rgb.map(|c| ((0.08 + 0.92 * c) * self.brightness * 255.0).clamp(0.0, 255.0) as u8)
    }

    fn draw<'a>(
        &self,
        supports: &[SupportSurface],
        objects: impl Iterator<Item = (&'a ObjectSpec, &'a Pose)>,
        tool: &'a Pose,
    ) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.width * self.height * 3);
        let sky = self.shade(SKY);
        for _ in 0..self.width * self.height {
            image.extend_from_slice(&sky);
        }

        let mut ordered: Vec<&SupportSurface> = supports.iter().collect();
        ordered.sort_by(|a, b| a.top.total_cmp(&b.top));
        for surface in ordered {
            let b = &surface.bounds;
            let corners = [
                [b.min[0], b.min[1]],
                [b.max[0], b.min[1]],
                [b.max[0], b.max[1]],
                [b.min[0], b.max[1]],
            ]
            .map(|[x, y]| self.project(Vector3::new(x, y, surface.top)));
            if let [Some(a), Some(b), Some(c), Some(d)] = corners {
                self.fill_quad(&mut image, [(a.0, a.1), (b.0, b.1), (c.0, c.1), (d.0, d.1)], self.shade(surface.color));
            }
        }

        // (depth, u, v, radius, colour), drawn far to near.
        let mut discs: Vec<(f64, f64, f64, f64, [u8; 3])> = objects
            .map(|(spec, pose)| (pose, spec.shape.footprint_radius(), self.shade(spec.color.rgb())))
            .chain(std::iter::once((tool, PUSHER_RADIUS, self.shade(TOOL_COLOR))))
            .filter_map(|(pose, radius, color)| {
                let (u, v, depth) = self.project(pose.translation.vector)?;
                Some((depth, u, v, self.focal * radius / depth, color))
            })
            .collect();
        discs.sort_by(|a, b| b.0.total_cmp(&a.0));
        for (_, u, v, r, color) in discs {
            self.fill_disc(&mut image, u, v, r, color);
        }
        image
    }

    fn fill_quad(&self, image: &mut [u8], quad: [(f64, f64); 4], color: [u8; 3]) {
        let (x0, x1, y0, y1) = self.pixel_box(
            quad.iter().map(|p| p.0).fold(f64::INFINITY, f64::min),
            quad.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max),
            quad.iter().map(|p| p.1).fold(f64::INFINITY, f64::min),
            quad.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max),
        );
        for y in y0..y1 {
            for x in x0..x1 {
                let p = (x as f64 + 0.5, y as f64 + 0.5);
                let mut sign = 0.0f64;
                let inside = (0..4).all(|i| {
                    let a = quad[i];
                    let b = quad[(i + 1) % 4];
                    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
                    if cross == 0.0 {
                        return true;
                    }
                    if sign == 0.0 {
                        sign = cross.signum();
                    }
                    cross.signum() == sign
                });
                if inside {
                    self.put(image, x, y, color);
                }
            }
        }
    }

    fn fill_disc(&self, image: &mut [u8], u: f64, v: f64, r: f64, color: [u8; 3]) {
        let (x0, x1, y0, y1) = self.pixel_box(u - r, u + r, v - r, v + r);
        for y in y0..y1 {
            for x in x0..x1 {
                let dx = x as f64 + 0.5 - u;
                let dy = y as f64 + 0.5 - v;
                if dx * dx + dy * dy <= r * r {
                    self.put(image, x, y, color);
                }
            }
        }
    }

    /// Clamp a float bounding box to pixel ranges `[x0, x1) x [y0, y1)`.
    fn pixel_box(&self, min_u: f64, max_u: f64, min_v: f64, max_v: f64) -> (usize, usize, usize, usize) {
        let clamp = |v: f64, hi: usize| v.max(0.0).min(hi as f64) as usize;
        (
            clamp(min_u.floor(), self.width),
            clamp(max_u.ceil(), self.width),
            clamp(min_v.floor(), self.height),
            clamp(max_v.ceil(), self.height),
        )
    }

    fn put(&self, image: &mut [u8], x: usize, y: usize, color: [u8; 3]) {
        let i = (y * self.width + x) * 3;
        image[i..i + 3].copy_from_slice(&color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::pose_at;
    use crate::scene::layout::{Color, SceneLayout, Shape};
    use crate::scene::traits::PlacedObject;
    use approx::assert_relative_eq;

    fn world(cube_at: (f64, f64)) -> (KinematicSim, ObjectSpec) {
        let layout = SceneLayout::default();
        let cube = ObjectSpec::new(Shape::Cube, Color::Red);
        let mut sim = KinematicSim::new(RobotSpec::default());
        sim.reset(&WorldSetup {
            robot_joints: RobotSpec::default().home,
            objects: vec![PlacedObject {
                spec: cube.clone(),
                pose: pose_at(cube_at.0, cube_at.1, cube.rest_height(0.0)),
            }],
            supports: layout.supports.clone(),
            lighting: Lighting::default(),
        })
        .unwrap();
        (sim, cube)
    }

    fn targets(x: f64, y: f64, z: f64, finger: f64) -> Vec<f64> {
        vec![x, y, z, 0.0, 0.0, 0.0, 0.0, finger, finger]
    }

    #[test]
    fn step_requires_reset() {
        let mut sim = KinematicSim::new(RobotSpec::default());
        assert!(matches!(sim.step(&RobotSpec::default().home), Err(EngineError::Step(_))));
    }

    #[test]
    fn closing_on_an_object_grasps_and_carries_it() {
        let (mut sim, cube) = world((0.5, 0.0));
        sim.step(&targets(0.5, 0.0, 0.02, 0.05)).unwrap();
        assert_eq!(sim.held_object(), None);
        sim.step(&targets(0.5, 0.0, 0.02, 0.0)).unwrap();
        assert_eq!(sim.held_object().as_deref(), Some(cube.id.as_str()));
        // Fingers stop at the object.
        assert_relative_eq!(sim.joint_positions()[7], 0.02);

        sim.step(&targets(0.55, 0.05, 0.15, 0.0)).unwrap();
        let pose = sim.object_pose(&cube.id).unwrap();
        assert_relative_eq!(pose.translation.vector, Vector3::new(0.55, 0.05, 0.15), epsilon = 1e-12);
        assert!(sim.in_contact(&cube.id));
    }

    #[test]
    fn opening_releases_onto_the_surface_below() {
        let (mut sim, cube) = world((0.5, 0.0));
        sim.step(&targets(0.5, 0.0, 0.02, 0.05)).unwrap();
        sim.step(&targets(0.5, 0.0, 0.02, 0.0)).unwrap();
        // Over the tray.
        sim.step(&targets(0.5, 0.33, 0.2, 0.0)).unwrap();
        sim.step(&targets(0.5, 0.33, 0.2, 0.05)).unwrap();
        assert_eq!(sim.held_object(), None);
        let pose = sim.object_pose(&cube.id).unwrap();
        assert_relative_eq!(pose.translation.z, cube.rest_height(0.02), epsilon = 1e-12);
    }

    #[test]
    fn lateral_motion_pushes_but_descent_does_not() {
        let (mut sim, cube) = world((0.5, 0.0));
        let contact = cube.shape.footprint_radius() + PUSHER_RADIUS;
        sim.step(&targets(0.5 - contact - 0.02, 0.0, 0.02, 0.0)).unwrap();
        for i in 1..=10 {
            let x = 0.5 - contact - 0.02 + 0.01 * i as f64;
            sim.step(&targets(x, 0.0, 0.02, 0.0)).unwrap();
        }
        let pushed = sim.object_pose(&cube.id).unwrap();
        assert_relative_eq!(pushed.translation.x, 0.5 + 0.08, epsilon = 1e-9);
        assert_relative_eq!(pushed.translation.y, 0.0, epsilon = 1e-12);

        let (mut sim, cube) = world((0.5, 0.0));
        sim.step(&targets(0.5, 0.0, 0.2, 0.0)).unwrap();
        sim.step(&targets(0.5, 0.0, 0.03, 0.0)).unwrap();
        let pose = sim.object_pose(&cube.id).unwrap();
        assert_relative_eq!(pose.translation.x, 0.5);
    }

    #[test]
    fn render_produces_hwc_frames() {
        let (sim, _) = world((0.5, 0.0));
        let camera = CameraSpec {
            width: 64,
            height: 48,
            ..CameraSpec::default()
        };
        let frame = sim.render(&camera).unwrap();
        assert_eq!(frame.shape(), &[48, 64, 3]);
        // The red cube is in view near the image centre.
        let bytes = frame.as_bytes();
        let reddish = bytes.chunks_exact(3).filter(|p| p[0] > 100 && p[1] < 60 && p[2] < 60).count();
        assert!(reddish > 0);
    }

    #[test]
    fn degenerate_camera_fails_to_render() {
        let (sim, _) = world((0.5, 0.0));
        let camera = CameraSpec {
            position: [0.5, 0.0, 1.0],
            look_at: [0.5, 0.0, 0.0],
            ..CameraSpec::default()
        };
        assert!(matches!(sim.render(&camera), Err(EngineError::Render(_))));
    }
}
