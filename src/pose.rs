//! Rigid-body pose math.
//!
//! A pose is a translation plus an orientation stored as an axis-angle vector
//! (rx, ry, rz): the vector encodes both axis (direction) and angle (magnitude)
//! via Rodrigues' formula. Being a minimal 3-parameter representation it needs
//! no renormalization between solver steps.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Number of pose parameters per part: [x, y, z, rx, ry, rz].
pub const POSE_PARAMS: usize = 6;

/// Rigid transform of a part in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Translation in world coordinates.
    pub position: [f64; 3],
    /// Orientation as an axis-angle vector.
    pub rotation: [f64; 3],
}

impl Pose {
    pub fn new(position: [f64; 3], rotation: [f64; 3]) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0; 3],
        }
    }

    /// Read a pose from six consecutive parameter-vector entries.
    pub fn from_params(params: &[f64], offset: usize) -> Self {
        Self {
            position: [params[offset], params[offset + 1], params[offset + 2]],
            rotation: [params[offset + 3], params[offset + 4], params[offset + 5]],
        }
    }

    /// Write this pose into six consecutive parameter-vector entries.
    pub fn write_params(&self, params: &mut [f64], offset: usize) {
        params[offset..offset + 3].copy_from_slice(&self.position);
        params[offset + 3..offset + 6].copy_from_slice(&self.rotation);
    }

    /// Transform a body-local point to world coordinates.
    pub fn transform_point(&self, local: [f64; 3]) -> Vector3<f64> {
        let r = rotation_matrix(&Vector3::from(self.rotation));
        r * Vector3::from(local) + Vector3::from(self.position)
    }

    /// Transform a body-local direction to world coordinates (rotation only).
    pub fn transform_direction(&self, local: [f64; 3]) -> Vector3<f64> {
        let r = rotation_matrix(&Vector3::from(self.rotation));
        r * Vector3::from(local)
    }

    /// Orientation as a unit quaternion in (x, y, z, w) order, the layout
    /// hosts with quaternion placements expect.
    pub fn rotation_quaternion(&self) -> [f64; 4] {
        let v = Vector3::from(self.rotation);
        let theta = v.norm();
        if theta < 1e-14 {
            return [0.0, 0.0, 0.0, 1.0];
        }
        let axis = v / theta;
        let s = (theta / 2.0).sin();
        [axis.x * s, axis.y * s, axis.z * s, (theta / 2.0).cos()]
    }

    /// Build a pose from a translation and a unit quaternion in (x, y, z, w)
    /// order. The quaternion need not be exactly normalized.
    pub fn from_quaternion(position: [f64; 3], q: [f64; 4]) -> Self {
        let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
        let vec = Vector3::new(q[0], q[1], q[2]) / norm;
        let n = vec.norm();
        if n < 1e-14 {
            return Self::new(position, [0.0; 3]);
        }
        let angle = 2.0 * clamped_acos(q[3] / norm);
        Self::new(position, (vec / n * angle).into())
    }
}

/// Rotation matrix from an axis-angle vector via Rodrigues' formula:
/// R = I + sin(theta) * K + (1 - cos(theta)) * K^2, with K = skew(axis).
pub(crate) fn rotation_matrix(v: &Vector3<f64>) -> Matrix3<f64> {
    let theta = v.norm();
    if theta < 1e-14 {
        return Matrix3::identity();
    }
    let k = skew(&(v / theta));
    Matrix3::identity() + theta.sin() * k + (1.0 - theta.cos()) * (k * k)
}

/// Skew-symmetric matrix of v: skew(v) * b = v x b.
fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// arccos clamped against small numeric overshoot outside [-1, 1].
pub(crate) fn clamped_acos(v: f64) -> f64 {
    v.clamp(-1.0, 1.0).acos()
}

/// Transform a body-local point given a pose stored in a parameter slice.
pub(crate) fn transform_point(params: &[f64], offset: usize, local: &[f64; 3]) -> Vector3<f64> {
    let pos = Vector3::new(params[offset], params[offset + 1], params[offset + 2]);
    let rot = Vector3::new(params[offset + 3], params[offset + 4], params[offset + 5]);
    rotation_matrix(&rot) * Vector3::from(*local) + pos
}

/// Transform a body-local direction given a pose stored in a parameter slice.
pub(crate) fn transform_direction(params: &[f64], offset: usize, local: &[f64; 3]) -> Vector3<f64> {
    let rot = Vector3::new(params[offset + 3], params[offset + 4], params[offset + 5]);
    rotation_matrix(&rot) * Vector3::from(*local)
}
