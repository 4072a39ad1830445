//! Constraint declarations.
//!
//! A declaration is a persisted record referencing two parts and one feature
//! on each, with type-specific parameters. The solver consumes declarations
//! in order and never mutates them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{ConstraintId, FeatureKind, PartId};

/// How two feature directions must relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectionOption {
    /// Directions unconstrained.
    #[default]
    None,
    /// Directions parallel, same sense.
    Aligned,
    /// Directions parallel, opposite sense.
    Opposed,
}

/// A declared constraint between two parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintDecl {
    pub id: ConstraintId,
    /// Human-readable name, used in diagnostics.
    pub name: String,
    pub part_a: PartId,
    pub part_b: PartId,
    pub kind: ConstraintKind,
}

/// Constraint type with its typed parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConstraintKind {
    /// Two planar faces: normals related per `direction`, planes separated by
    /// `offset` along the first face's normal (0 for coincidence).
    Plane {
        face_a: usize,
        face_b: usize,
        direction: DirectionOption,
        offset: f64,
    },
    /// Two cylindrical faces: axes collinear, directions per `direction`.
    Axial {
        face_a: usize,
        face_b: usize,
        direction: DirectionOption,
    },
    /// Fixed angle between two planar faces' normals, in degrees.
    AngleBetweenPlanes {
        face_a: usize,
        face_b: usize,
        degrees: f64,
    },
    /// Two circular edges: axes collinear, circle planes separated by
    /// `offset`, directions per `direction`.
    CircularEdge {
        edge_a: usize,
        edge_b: usize,
        direction: DirectionOption,
        offset: f64,
    },
}

impl ConstraintDecl {
    pub fn plane(
        part_a: PartId,
        face_a: usize,
        part_b: PartId,
        face_b: usize,
        direction: DirectionOption,
        offset: f64,
    ) -> Self {
        Self::with_kind(
            part_a,
            part_b,
            ConstraintKind::Plane {
                face_a,
                face_b,
                direction,
                offset,
            },
        )
    }

    pub fn axial(
        part_a: PartId,
        face_a: usize,
        part_b: PartId,
        face_b: usize,
        direction: DirectionOption,
    ) -> Self {
        Self::with_kind(
            part_a,
            part_b,
            ConstraintKind::Axial {
                face_a,
                face_b,
                direction,
            },
        )
    }

    pub fn angle_between_planes(
        part_a: PartId,
        face_a: usize,
        part_b: PartId,
        face_b: usize,
        degrees: f64,
    ) -> Self {
        Self::with_kind(
            part_a,
            part_b,
            ConstraintKind::AngleBetweenPlanes {
                face_a,
                face_b,
                degrees,
            },
        )
    }

    pub fn circular_edge(
        part_a: PartId,
        edge_a: usize,
        part_b: PartId,
        edge_b: usize,
        direction: DirectionOption,
        offset: f64,
    ) -> Self {
        Self::with_kind(
            part_a,
            part_b,
            ConstraintKind::CircularEdge {
                edge_a,
                edge_b,
                direction,
                offset,
            },
        )
    }

    fn with_kind(part_a: PartId, part_b: PartId, kind: ConstraintKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            part_a,
            part_b,
            kind,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// The feature references of the two sides: (kind, index) per part.
    pub fn feature_refs(&self) -> ((FeatureKind, usize), (FeatureKind, usize)) {
        match &self.kind {
            ConstraintKind::Plane { face_a, face_b, .. }
            | ConstraintKind::AngleBetweenPlanes { face_a, face_b, .. } => (
                (FeatureKind::PlanarFace, *face_a),
                (FeatureKind::PlanarFace, *face_b),
            ),
            ConstraintKind::Axial { face_a, face_b, .. } => (
                (FeatureKind::CylindricalFace, *face_a),
                (FeatureKind::CylindricalFace, *face_b),
            ),
            ConstraintKind::CircularEdge { edge_a, edge_b, .. } => (
                (FeatureKind::CircularEdge, *edge_a),
                (FeatureKind::CircularEdge, *edge_b),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_refs_match_constraint_kind() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = ConstraintDecl::axial(a, 2, b, 7, DirectionOption::Aligned);
        let ((kind_a, idx_a), (kind_b, idx_b)) = c.feature_refs();
        assert_eq!(kind_a, FeatureKind::CylindricalFace);
        assert_eq!(idx_a, 2);
        assert_eq!(kind_b, FeatureKind::CylindricalFace);
        assert_eq!(idx_b, 7);
    }

    #[test]
    fn declaration_serializes_with_type_tag() {
        let c = ConstraintDecl::plane(
            Uuid::new_v4(),
            0,
            Uuid::new_v4(),
            5,
            DirectionOption::Opposed,
            1.5,
        );
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"type\":\"Plane\""));
    }
}
