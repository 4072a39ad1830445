//! Pose parameterization.
//!
//! [`VariableManager`] is the single source of truth for the flat pose vector
//! X: which slice belongs to which part, what the fixed parts' constant poses
//! are, and how a candidate X maps back to part poses. Evaluation against a
//! candidate X is pure; only [`VariableManager::commit`] touches the document.

use nalgebra::Vector3;
use std::collections::HashMap;
use std::ops::Range;

use crate::document::{Document, LocalFeature, Part, PartId};
use crate::error::SolveError;
use crate::pose::{transform_direction, transform_point, Pose, POSE_PARAMS};

/// World-space evaluation of a feature primitive under a candidate pose.
#[derive(Debug, Clone)]
pub struct WorldFeature {
    pub point: Vector3<f64>,
    /// Plane normal or axis direction, unit-length.
    pub direction: Vector3<f64>,
    pub radius: Option<f64>,
}

#[derive(Debug, Clone)]
struct PartSlot {
    id: PartId,
    name: String,
    /// Start of this part's six parameters in X, for free parts.
    param_offset: Option<usize>,
    /// Constant pose parameters, for fixed parts.
    fixed_params: [f64; 6],
}

/// Owns the mapping between part poses and the flat pose vector.
#[derive(Debug, Clone)]
pub struct VariableManager {
    slots: Vec<PartSlot>,
    index: HashMap<PartId, usize>,
    x0: Vec<f64>,
}

impl VariableManager {
    /// Build the initial pose vector from the parts' current poses. Fixed
    /// parts are excluded from X and stored as constants. Fails fast when no
    /// part anchors the assembly.
    pub fn new(parts: &[Part]) -> Result<Self, SolveError> {
        if !parts.iter().any(|p| p.fixed_position) {
            return Err(SolveError::NoFixedPart);
        }
        let mut slots = Vec::with_capacity(parts.len());
        let mut index = HashMap::new();
        let mut x0 = Vec::new();
        for part in parts {
            let mut params = [0.0; 6];
            part.pose.write_params(&mut params, 0);
            let param_offset = if part.fixed_position {
                None
            } else {
                let offset = x0.len();
                x0.extend_from_slice(&params);
                Some(offset)
            };
            index.insert(part.id, slots.len());
            slots.push(PartSlot {
                id: part.id,
                name: part.name.clone(),
                param_offset,
                fixed_params: params,
            });
        }
        Ok(Self { slots, index, x0 })
    }

    /// The initial pose vector X0.
    pub fn x0(&self) -> Vec<f64> {
        self.x0.clone()
    }

    /// Number of free parameters in X.
    pub fn free_param_count(&self) -> usize {
        self.x0.len()
    }

    pub fn part_count(&self) -> usize {
        self.slots.len()
    }

    /// Internal index of a part, if it is known to this manager.
    pub fn part_index(&self, id: PartId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn part_id(&self, part: usize) -> PartId {
        self.slots[part].id
    }

    pub fn part_name(&self, part: usize) -> &str {
        &self.slots[part].name
    }

    pub fn is_fixed(&self, part: usize) -> bool {
        self.slots[part].param_offset.is_none()
    }

    /// The columns of X belonging to a part; None for fixed parts.
    pub fn param_range(&self, part: usize) -> Option<Range<usize>> {
        self.slots[part]
            .param_offset
            .map(|o| o..o + POSE_PARAMS)
    }

    /// Columns of every free part, i.e. the global solve's variable set.
    pub fn all_free_params(&self) -> Vec<usize> {
        (0..self.x0.len()).collect()
    }

    /// Evaluate a body-local feature in world space under a candidate X.
    /// Pure over (x, feature); the solver calls this many times per iteration.
    pub fn evaluate(&self, x: &[f64], part: usize, feature: &LocalFeature) -> WorldFeature {
        let slot = &self.slots[part];
        let (params, offset): (&[f64], usize) = match slot.param_offset {
            Some(o) => (x, o),
            None => (&slot.fixed_params, 0),
        };
        let point = feature.point();
        let direction = feature.direction();
        WorldFeature {
            point: transform_point(params, offset, &point),
            direction: transform_direction(params, offset, &direction),
            radius: feature.radius(),
        }
    }

    /// The pose of a part under a candidate X.
    pub fn pose(&self, x: &[f64], part: usize) -> Pose {
        let slot = &self.slots[part];
        match slot.param_offset {
            Some(o) => Pose::from_params(x, o),
            None => Pose::from_params(&slot.fixed_params, 0),
        }
    }

    /// Poses of the free parts under a candidate X, in part order.
    pub fn free_poses(&self, x: &[f64]) -> Vec<(PartId, Pose)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                slot.param_offset
                    .map(|o| (slot.id, Pose::from_params(x, o)))
            })
            .collect()
    }

    /// Write the final pose vector back into the document. The only mutating
    /// operation of this component; called once, after a successful solve.
    pub fn commit<D: Document + ?Sized>(&self, x: &[f64], doc: &mut D) {
        for (id, pose) in self.free_poses(x) {
            doc.set_pose(id, pose);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;
    use uuid::Uuid;

    fn part(name: &str, pose: Pose, fixed: bool) -> Part {
        Part {
            id: Uuid::new_v4(),
            name: name.to_string(),
            pose,
            fixed_position: fixed,
        }
    }

    #[test]
    fn rejects_assembly_without_fixed_part() {
        let parts = vec![part("a", Pose::identity(), false)];
        assert!(matches!(
            VariableManager::new(&parts),
            Err(SolveError::NoFixedPart)
        ));
    }

    #[test]
    fn fixed_parts_are_excluded_from_x() {
        let parts = vec![
            part("base", Pose::new([1.0, 2.0, 3.0], [0.0; 3]), true),
            part("free", Pose::new([4.0, 5.0, 6.0], [0.0; 3]), false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        assert_eq!(vm.free_param_count(), 6);
        assert_eq!(vm.x0(), vec![4.0, 5.0, 6.0, 0.0, 0.0, 0.0]);
        assert!(vm.is_fixed(0));
        assert!(vm.param_range(0).is_none());
        assert_eq!(vm.param_range(1), Some(0..6));
    }

    #[test]
    fn evaluate_uses_fixed_constants_for_fixed_parts() {
        let parts = vec![
            part("base", Pose::new([0.0, 0.0, 1.0], [0.0, 0.0, PI / 2.0]), true),
            part("free", Pose::identity(), false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        let x = vm.x0();
        let f = LocalFeature::Plane {
            point: [1.0, 0.0, 0.0],
            normal: [1.0, 0.0, 0.0],
        };
        let w = vm.evaluate(&x, 0, &f);
        assert_relative_eq!(w.point, Vector3::new(0.0, 1.0, 1.0), epsilon = 1e-10);
        assert_relative_eq!(w.direction, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-10);
    }

    #[test]
    fn free_poses_reads_back_candidate_vector() {
        let parts = vec![
            part("base", Pose::identity(), true),
            part("free", Pose::identity(), false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        let x = vec![1.0, 2.0, 3.0, 0.1, 0.2, 0.3];
        let poses = vm.free_poses(&x);
        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].1.position, [1.0, 2.0, 3.0]);
        assert_eq!(poses[0].1.rotation, [0.1, 0.2, 0.3]);
    }
}
