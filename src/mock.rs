//! MockDocument — deterministic in-memory [`Document`] implementation.
//!
//! Parts are axis-aligned boxes with the corner at the local origin; planar
//! faces are indexed 0..6 in the order -x, +x, -y, +y, -z, +z, with the face
//! centers as plane points. Cylindrical-face and circular-edge features do
//! not arise on plain boxes, so they (and any face) can be injected per part
//! via [`MockDocument::set_feature`].

use std::collections::HashMap;

use uuid::Uuid;

use crate::constraint::ConstraintDecl;
use crate::document::{
    ConstraintId, Document, FeatureError, FeatureKind, LocalFeature, Part, PartId,
};
use crate::pose::Pose;

#[derive(Debug, Clone)]
struct MockPart {
    part: Part,
    /// Box dimensions [lx, ly, lz].
    dims: [f64; 3],
}

/// In-memory document of box parts and constraint declarations.
#[derive(Debug, Clone, Default)]
pub struct MockDocument {
    parts: Vec<MockPart>,
    constraints: Vec<ConstraintDecl>,
    overrides: HashMap<(PartId, FeatureKind, usize), LocalFeature>,
}

impl MockDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a box part with the given dimensions and starting pose.
    pub fn add_box(&mut self, name: &str, dims: [f64; 3], pose: Pose, fixed: bool) -> PartId {
        let id = Uuid::new_v4();
        self.parts.push(MockPart {
            part: Part {
                id,
                name: name.to_string(),
                pose,
                fixed_position: fixed,
            },
            dims,
        });
        id
    }

    pub fn add_constraint(&mut self, decl: ConstraintDecl) -> ConstraintId {
        let id = decl.id;
        self.constraints.push(decl);
        id
    }

    /// Remove a part, leaving any constraints that reference it broken.
    pub fn remove_part(&mut self, id: PartId) {
        self.parts.retain(|p| p.part.id != id);
    }

    pub fn remove_constraint(&mut self, id: ConstraintId) {
        self.constraints.retain(|c| c.id != id);
    }

    /// Inject a feature primitive for (part, kind, index), overriding the box
    /// face table. This is how cylinder axes and circular edges are modeled.
    pub fn set_feature(
        &mut self,
        part: PartId,
        kind: FeatureKind,
        index: usize,
        feature: LocalFeature,
    ) {
        self.overrides.insert((part, kind, index), feature);
    }

    pub fn part_pose(&self, id: PartId) -> Option<Pose> {
        self.parts
            .iter()
            .find(|p| p.part.id == id)
            .map(|p| p.part.pose)
    }

    fn box_face(dims: &[f64; 3], index: usize) -> Option<LocalFeature> {
        let [lx, ly, lz] = *dims;
        let (point, normal) = match index {
            0 => ([0.0, ly / 2.0, lz / 2.0], [-1.0, 0.0, 0.0]),
            1 => ([lx, ly / 2.0, lz / 2.0], [1.0, 0.0, 0.0]),
            2 => ([lx / 2.0, 0.0, lz / 2.0], [0.0, -1.0, 0.0]),
            3 => ([lx / 2.0, ly, lz / 2.0], [0.0, 1.0, 0.0]),
            4 => ([lx / 2.0, ly / 2.0, 0.0], [0.0, 0.0, -1.0]),
            5 => ([lx / 2.0, ly / 2.0, lz], [0.0, 0.0, 1.0]),
            _ => return None,
        };
        Some(LocalFeature::Plane { point, normal })
    }
}

impl Document for MockDocument {
    fn parts(&self) -> Vec<Part> {
        self.parts.iter().map(|p| p.part.clone()).collect()
    }

    fn constraints(&self) -> Vec<ConstraintDecl> {
        self.constraints.clone()
    }

    fn resolve_feature(
        &self,
        part: PartId,
        kind: FeatureKind,
        index: usize,
    ) -> Result<LocalFeature, FeatureError> {
        if let Some(feature) = self.overrides.get(&(part, kind, index)) {
            return Ok(feature.clone());
        }
        let slot = self
            .parts
            .iter()
            .find(|p| p.part.id == part)
            .ok_or(FeatureError::PartNotFound { part })?;
        if kind == FeatureKind::PlanarFace {
            if let Some(feature) = Self::box_face(&slot.dims, index) {
                return Ok(feature);
            }
        }
        Err(FeatureError::FeatureNotFound { part, kind, index })
    }

    fn set_pose(&mut self, part: PartId, pose: Pose) {
        if let Some(slot) = self.parts.iter_mut().find(|p| p.part.id == part) {
            slot.part.pose = pose;
        }
    }
}
