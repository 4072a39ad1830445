//! Host document interface.
//!
//! The solver never owns parts or constraint declarations; it reads them
//! through [`Document`] as snapshots, solves, and writes poses back through a
//! single commit step. Feature geometry is queried in body-local coordinates
//! so the solver can compose it with any candidate pose.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constraint::ConstraintDecl;
use crate::pose::Pose;

/// Stable identity of a part in the host document.
pub type PartId = Uuid;

/// Stable identity of a constraint declaration.
pub type ConstraintId = Uuid;

/// Snapshot of one part: identity, current pose, and whether it anchors the
/// assembly. At least one part must have `fixed_position` set for a solve to
/// be defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: PartId,
    /// Human-readable name, used in diagnostics.
    pub name: String,
    pub pose: Pose,
    /// Fixed parts are excluded from the solve's free variables.
    pub fixed_position: bool,
}

/// Kind of geometric feature a constraint references on a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    PlanarFace,
    CylindricalFace,
    CircularEdge,
}

/// A feature primitive in body-local coordinates, as returned by the host's
/// geometry query. Directions need not be unit-length; the solver normalizes
/// them and rejects zero-length ones as degenerate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LocalFeature {
    /// A planar face: a point on the plane plus its outward normal.
    Plane { point: [f64; 3], normal: [f64; 3] },
    /// A cylinder or circle axis: a point on the axis plus its direction,
    /// with the radius if the feature has one.
    Axis {
        point: [f64; 3],
        direction: [f64; 3],
        radius: Option<f64>,
    },
}

impl LocalFeature {
    pub fn point(&self) -> [f64; 3] {
        match self {
            LocalFeature::Plane { point, .. } | LocalFeature::Axis { point, .. } => *point,
        }
    }

    /// The normal for a plane, the axis direction otherwise.
    pub fn direction(&self) -> [f64; 3] {
        match self {
            LocalFeature::Plane { normal, .. } => *normal,
            LocalFeature::Axis { direction, .. } => *direction,
        }
    }

    pub fn radius(&self) -> Option<f64> {
        match self {
            LocalFeature::Plane { .. } => None,
            LocalFeature::Axis { radius, .. } => *radius,
        }
    }
}

/// Errors from the host's feature query.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeatureError {
    #[error("part {part} not found")]
    PartNotFound { part: PartId },

    #[error("part {part} has no {kind:?} at index {index}")]
    FeatureNotFound {
        part: PartId,
        kind: FeatureKind,
        index: usize,
    },
}

/// The host document model consumed by the solver.
///
/// `parts` and `constraints` return snapshots in stable declaration order;
/// `resolve_feature` is the geometry-kernel query capability; `set_pose` is
/// the only mutation the solver ever performs, and only after a full success
/// (or at the caller's explicit request for a rejected partial solution).
pub trait Document {
    /// Ordered list of parts.
    fn parts(&self) -> Vec<Part>;

    /// Constraint declarations in declaration order.
    fn constraints(&self) -> Vec<ConstraintDecl>;

    /// Resolve a feature reference to a body-local primitive.
    fn resolve_feature(
        &self,
        part: PartId,
        kind: FeatureKind,
        index: usize,
    ) -> Result<LocalFeature, FeatureError>;

    /// Write a part's pose back into the document.
    fn set_pose(&mut self, part: PartId, pose: Pose);
}
