//! Pose math for per-camera object distances.
//!
//! Object and camera positions are expressed in the same parent frame, in
//! metres, using the simulator's convention that a camera looks along its
//! local `+Z` axis.  Distances are reported in millimetres.
//!
//! # Example
//!
//! ```rust
//! use simbridge_perception::transform::{DistanceMode, Pose, Quaternion, Vec3, camera_distances};
//!
//! // Camera 1 m behind the origin, looking forward (+Z).
//! let camera = Pose::new(Vec3::new(0.0, 0.0, -1.0), Quaternion::identity());
//! let d = camera_distances(Vec3::new(0.3, 0.0, 1.0), &[camera], DistanceMode::AlongAxis);
//! assert!((d[0] - 2000.0).abs() < 1e-6);
//! ```

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Unit forward axis of an unrotated camera.
    pub fn forward() -> Self {
        Self::new(0.0, 0.0, 1.0)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn dot(self, rhs: Self) -> f64 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn length(self) -> f64 {
        self.dot(self).sqrt()
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from([x, y, z]: [f64; 3]) -> Self {
        Self::new(x, y, z)
    }
}

/// A unit quaternion representing a 3-D rotation (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    /// Create a quaternion.  The caller is responsible for providing a unit
    /// quaternion (|q| = 1).
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// The identity rotation (no rotation).
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `angle_rad` around a unit `axis`.
    pub fn from_axis_angle(axis: Vec3, angle_rad: f64) -> Self {
        let (s, c) = (angle_rad / 2.0).sin_cos();
        Self::new(c, axis.x * s, axis.y * s, axis.z * s)
    }

    /// Rotation from Euler angles in degrees, applied Z first, then X, then Y
    /// (the order the simulator's inspector uses).
    pub fn from_euler_degrees(x: f64, y: f64, z: f64) -> Self {
        let qx = Self::from_axis_angle(Vec3::new(1.0, 0.0, 0.0), x.to_radians());
        let qy = Self::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), y.to_radians());
        let qz = Self::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), z.to_radians());
        qy.mul(qx).mul(qz)
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Vec3::new(rotated.x, rotated.y, rotated.z)
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// Position and orientation of a camera relative to the objects' parent frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quaternion,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quaternion) -> Self {
        Self { position, rotation }
    }

    /// Direction the pose looks along, in the parent frame.
    pub fn forward(&self) -> Vec3 {
        self.rotation.rotate(Vec3::forward())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Distances
// ────────────────────────────────────────────────────────────────────────────

/// How the distance from a camera to an object is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMode {
    /// Depth along the camera's optical axis; negative behind the camera.
    #[default]
    AlongAxis,
    /// Straight-line distance between the two positions.
    Euclidean,
}

/// Distance in millimetres from each camera to `position`, in camera order.
pub fn camera_distances(position: Vec3, cameras: &[Pose], mode: DistanceMode) -> Vec<f64> {
    cameras
        .iter()
        .map(|camera| {
            let to_object = position.sub(camera.position);
            let metres = match mode {
                DistanceMode::AlongAxis => to_object.dot(camera.forward()),
                DistanceMode::Euclidean => to_object.length(),
            };
            metres * 1000.0
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_1_SQRT_2;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // ── Quaternion ──────────────────────────────────────────────────────────

    #[test]
    fn quaternion_identity_rotate_is_noop() {
        let r = Quaternion::identity().rotate(Vec3::new(1.0, 2.0, 3.0));
        assert!(close(r.x, 1.0) && close(r.y, 2.0) && close(r.z, 3.0));
    }

    #[test]
    fn quaternion_90deg_about_z_rotates_x_to_y() {
        let q = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let r = q.rotate(Vec3::new(1.0, 0.0, 0.0));
        assert!(close(r.x, 0.0), "x should be ~0, got {}", r.x);
        assert!(close(r.y, 1.0), "y should be ~1, got {}", r.y);
    }

    #[test]
    fn quaternion_conjugate_is_inverse() {
        let q = Quaternion::from_euler_degrees(30.0, 45.0, 10.0);
        let prod = q.mul(q.conjugate());
        assert!(close(prod.w, 1.0));
        assert!(close(prod.x, 0.0) && close(prod.y, 0.0) && close(prod.z, 0.0));
    }

    #[test]
    fn yaw_turns_forward_towards_x() {
        let pose = Pose::new(Vec3::zero(), Quaternion::from_euler_degrees(0.0, 90.0, 0.0));
        let f = pose.forward();
        assert!(close(f.x, 1.0) && close(f.y, 0.0) && close(f.z, 0.0), "{f:?}");
    }

    // ── Distances ───────────────────────────────────────────────────────────

    #[test]
    fn along_axis_ignores_lateral_offset() {
        let camera = Pose::new(Vec3::new(0.0, 0.0, -1.0), Quaternion::identity());
        let d = camera_distances(Vec3::new(0.5, 0.25, 1.0), &[camera], DistanceMode::AlongAxis);
        assert!(close(d[0], 2000.0));
    }

    #[test]
    fn behind_the_camera_is_negative() {
        let camera = Pose::default();
        let d = camera_distances(Vec3::new(0.0, 0.0, -0.5), &[camera], DistanceMode::AlongAxis);
        assert!(close(d[0], -500.0));
    }

    #[test]
    fn euclidean_is_straight_line() {
        let camera = Pose::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::identity());
        let d = camera_distances(Vec3::new(4.0, 4.0, 0.0), &[camera], DistanceMode::Euclidean);
        assert!(close(d[0], 5000.0));
    }

    #[test]
    fn one_distance_per_camera_in_order() {
        let cameras = [
            Pose::new(Vec3::new(0.0, 0.0, -1.0), Quaternion::identity()),
            Pose::new(Vec3::new(0.0, 0.0, -3.0), Quaternion::identity()),
        ];
        let d = camera_distances(Vec3::zero(), &cameras, DistanceMode::AlongAxis);
        assert_eq!(d.len(), 2);
        assert!(close(d[0], 1000.0) && close(d[1], 3000.0));
    }

    #[test]
    fn no_cameras_no_distances() {
        assert!(camera_distances(Vec3::zero(), &[], DistanceMode::Euclidean).is_empty());
    }
}
