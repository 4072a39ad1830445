//! Incremental constraint-system chain.
//!
//! Systems are immutable nodes in an arena: the root holds the initial pose
//! vector with one fixed part, and every Union operation extends a parent node
//! with one more residual, producing a new node. Each node stores the residual
//! its fold added; a node's full residual set is reconstructed by walking the
//! parent links, so folding again from an earlier node forks the chain without
//! invalidating anything already recorded. A failed fold leaves the parent
//! untouched and records a terminal Rejected node holding the best iterate,
//! keeping the last known-good system available for rollback.
//!
//! Each Union first attempts a local solve, freeing a single referenced part
//! against the full accumulated residual set (residuals not touching that
//! part are constant over its parameters, so earlier constraints are
//! preserved). Only when no local candidate converges does the fold escalate
//! to a global solve over every non-fixed part.

use tracing::debug;

use crate::constraint::DirectionOption;
use crate::error::UnionError;
use crate::residual::{collect_residuals, Residual, ResolvedFeature};
use crate::solver::{rows_rank_deficient, solve, SolverConfig, SolverOutput};
use crate::variables::VariableManager;

/// Index of a system node in its arena.
pub type SystemId = usize;

/// Lifecycle state of a system node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// Initial system: one fixed part, no constraints folded.
    Root,
    /// A consistent system with n residuals folded.
    Intermediate,
    /// Terminal: the fold that produced this node failed to converge.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct SystemNode {
    pub parent: Option<SystemId>,
    pub state: SystemState,
    /// Pose vector satisfying every residual folded up to this node
    /// (best iterate only, for Rejected nodes).
    x: Vec<f64>,
    /// The residual this node's fold added; None only for the root.
    residual: Option<Residual>,
    /// Parts already positioned by some fold up to this node, by
    /// VariableManager index.
    placed: Vec<bool>,
}

/// Arena of constraint-system nodes sharing one [`VariableManager`]; parent
/// links are indices, making rollback to any earlier fold step cheap.
pub struct SystemArena {
    vm: VariableManager,
    config: SolverConfig,
    nodes: Vec<SystemNode>,
}

impl SystemArena {
    /// Create the arena with its root system at the parts' initial poses.
    pub fn new(vm: VariableManager, config: SolverConfig) -> Self {
        let placed = vec![false; vm.part_count()];
        let x = vm.x0();
        Self {
            vm,
            config,
            nodes: vec![SystemNode {
                parent: None,
                state: SystemState::Root,
                x,
                residual: None,
                placed,
            }],
        }
    }

    pub fn root(&self) -> SystemId {
        0
    }

    pub fn vm(&self) -> &VariableManager {
        &self.vm
    }

    pub fn node(&self, id: SystemId) -> &SystemNode {
        &self.nodes[id]
    }

    /// The pose vector of a node.
    pub fn x(&self, id: SystemId) -> &[f64] {
        &self.nodes[id].x
    }

    /// The residuals folded in up to a node, root first, collected off the
    /// parent chain. Valid for any node ever recorded, forks included.
    pub fn residuals_at(&self, id: SystemId) -> Vec<Residual> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            let node = &self.nodes[node_id];
            if let Some(residual) = &node.residual {
                chain.push(residual.clone());
            }
            cursor = node.parent;
        }
        chain.reverse();
        chain
    }

    /// Sum of squared residuals of a node's system at its own pose vector.
    pub fn residual_at(&self, id: SystemId) -> f64 {
        collect_residuals(&self.residuals_at(id), &self.vm, &self.nodes[id].x)
            .iter()
            .map(|r| r * r)
            .sum()
    }

    /// Columns of the global variable set (every non-fixed part).
    pub fn global_params(&self) -> Vec<usize> {
        self.vm.all_free_params()
    }

    pub fn axis_alignment_union(
        &mut self,
        parent: SystemId,
        a: ResolvedFeature,
        b: ResolvedFeature,
        direction: DirectionOption,
    ) -> Result<SystemId, UnionError> {
        self.union(parent, Residual::AxisAlignment { a, b, direction })
    }

    pub fn plane_offset_union(
        &mut self,
        parent: SystemId,
        a: ResolvedFeature,
        b: ResolvedFeature,
        offset: f64,
    ) -> Result<SystemId, UnionError> {
        self.union(parent, Residual::PlaneOffset { a, b, offset })
    }

    /// `angle` in radians.
    pub fn angle_union(
        &mut self,
        parent: SystemId,
        a: ResolvedFeature,
        b: ResolvedFeature,
        angle: f64,
    ) -> Result<SystemId, UnionError> {
        self.union(parent, Residual::Angle { a, b, angle })
    }

    pub fn axis_distance_union(
        &mut self,
        parent: SystemId,
        a: ResolvedFeature,
        b: ResolvedFeature,
        distance: f64,
    ) -> Result<SystemId, UnionError> {
        self.union(parent, Residual::AxisDistance { a, b, distance })
    }

    /// Fold one residual into the parent system: the Union operation all the
    /// typed variants above delegate to.
    pub fn union(&mut self, parent: SystemId, residual: Residual) -> Result<SystemId, UnionError> {
        if self.nodes[parent].state == SystemState::Rejected {
            return Err(UnionError::RejectedParent);
        }

        let (part_a, part_b) = residual.parts();

        if residual.equation_count() == 0 {
            // directionConstraint = none: pass-through, but the fold must
            // still succeed so later offset/distance terms apply.
            let node = SystemNode {
                parent: Some(parent),
                state: SystemState::Intermediate,
                x: self.nodes[parent].x.clone(),
                residual: Some(residual),
                placed: self.nodes[parent].placed.clone(),
            };
            return Ok(self.push(node));
        }

        let mut residuals = self.residuals_at(parent);
        residuals.push(residual.clone());
        let parent_x = self.nodes[parent].x.clone();

        // Local solve: one movable referenced part at a time, parts not yet
        // placed by this chain first.
        let mut candidates: Vec<usize> = Vec::new();
        for &p in &[part_a, part_b] {
            if !self.vm.is_fixed(p) && !self.nodes[parent].placed[p] && !candidates.contains(&p) {
                candidates.push(p);
            }
        }
        for &p in &[part_a, part_b] {
            if !self.vm.is_fixed(p) && !candidates.contains(&p) {
                candidates.push(p);
            }
        }

        for &candidate in &candidates {
            let Some(range) = self.vm.param_range(candidate) else {
                continue;
            };
            let active: Vec<usize> = range.collect();
            let out = solve(&residuals, &self.vm, &parent_x, &active, &self.config);
            if out.converged {
                debug!(
                    part = self.vm.part_name(candidate),
                    iterations = out.iterations,
                    residual = out.residual,
                    "local solve converged"
                );
                return Ok(self.accept(parent, out.x, residual, part_a, part_b));
            }
        }

        // Global solve over every non-fixed part, starting from the parent's
        // pose vector.
        debug!(candidates = candidates.len(), "escalating to global solve");
        let active = self.vm.all_free_params();
        let out = solve(&residuals, &self.vm, &parent_x, &active, &self.config);
        if out.converged {
            debug!(
                iterations = out.iterations,
                residual = out.residual,
                "global solve converged"
            );
            return Ok(self.accept(parent, out.x, residual, part_a, part_b));
        }

        // Dependent Jacobian rows at the best iterate mean the new equation
        // measures along directions earlier equations already fix: redundant
        // or contradictory, not merely unconverged.
        let dependent =
            out.rank_deficient || rows_rank_deficient(&residuals, &self.vm, &out.x, &active);
        Err(self.reject(parent, residual, out, dependent))
    }

    fn accept(
        &mut self,
        parent: SystemId,
        x: Vec<f64>,
        residual: Residual,
        part_a: usize,
        part_b: usize,
    ) -> SystemId {
        let mut placed = self.nodes[parent].placed.clone();
        placed[part_a] = true;
        placed[part_b] = true;
        self.push(SystemNode {
            parent: Some(parent),
            state: SystemState::Intermediate,
            x,
            residual: Some(residual),
            placed,
        })
    }

    fn reject(
        &mut self,
        parent: SystemId,
        residual: Residual,
        out: SolverOutput,
        rank_deficient: bool,
    ) -> UnionError {
        let node = SystemNode {
            parent: Some(parent),
            state: SystemState::Rejected,
            x: out.x,
            residual: Some(residual),
            placed: self.nodes[parent].placed.clone(),
        };
        let rejected = self.push(node);
        if rank_deficient {
            UnionError::RankDeficient { rejected }
        } else {
            UnionError::NotConverged {
                iterations: out.iterations,
                residual: out.residual,
                rejected,
            }
        }
    }

    fn push(&mut self, node: SystemNode) -> SystemId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{LocalFeature, Part};
    use crate::pose::Pose;
    use approx::assert_relative_eq;
    use uuid::Uuid;

    fn part(name: &str, pose: Pose, fixed: bool) -> Part {
        Part {
            id: Uuid::new_v4(),
            name: name.to_string(),
            pose,
            fixed_position: fixed,
        }
    }

    fn plane(p: usize, point: [f64; 3], normal: [f64; 3]) -> ResolvedFeature {
        ResolvedFeature::new(p, LocalFeature::Plane { point, normal }).unwrap()
    }

    fn two_part_arena(free_start: Pose) -> SystemArena {
        let parts = vec![
            part("base", Pose::identity(), true),
            part("free", free_start, false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        SystemArena::new(vm, SolverConfig::default())
    }

    #[test]
    fn root_node_holds_initial_pose_vector() {
        let arena = two_part_arena(Pose::new([0.0, 0.0, 5.0], [0.0; 3]));
        let root = arena.root();
        assert_eq!(arena.node(root).state, SystemState::Root);
        assert_eq!(arena.x(root), &[0.0, 0.0, 5.0, 0.0, 0.0, 0.0]);
        assert!(arena.residuals_at(root).is_empty());
    }

    #[test]
    fn direction_none_union_is_a_pass_through() {
        let mut arena = two_part_arena(Pose::new([0.0, 0.0, 5.0], [0.0; 3]));
        let root = arena.root();
        let sys = arena
            .axis_alignment_union(
                root,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
                DirectionOption::None,
            )
            .unwrap();
        assert_eq!(arena.node(sys).state, SystemState::Intermediate);
        assert_eq!(arena.x(sys), arena.x(root));
    }

    #[test]
    fn plane_offset_union_positions_free_part() {
        let mut arena = two_part_arena(Pose::new([0.0, 0.0, 5.0], [0.0; 3]));
        let root = arena.root();
        let sys = arena
            .plane_offset_union(
                root,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                0.0,
            )
            .unwrap();
        assert_relative_eq!(arena.x(sys)[2], 2.0, epsilon = 1e-4);
        assert!(arena.residual_at(sys) < 1e-10);
    }

    #[test]
    fn failed_fold_preserves_parent_and_records_rejected_node() {
        let mut arena = two_part_arena(Pose::new([0.0, 0.0, 5.0], [0.0; 3]));
        let root = arena.root();
        let sys = arena
            .plane_offset_union(
                root,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                0.0,
            )
            .unwrap();
        // Same planes, different offset: unsatisfiable together.
        let err = arena
            .plane_offset_union(
                sys,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                5.0,
            )
            .unwrap_err();
        let rejected = err.rejected_system().expect("rejected node recorded");
        assert_eq!(arena.node(rejected).state, SystemState::Rejected);
        // Parent still satisfies its own system.
        assert!(arena.residual_at(sys) < 1e-10);
        assert_relative_eq!(arena.x(sys)[2], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn contradictory_fold_is_classified_rank_deficient() {
        let mut arena = two_part_arena(Pose::new([0.0, 0.0, 5.0], [0.0; 3]));
        let root = arena.root();
        let sys = arena
            .plane_offset_union(
                root,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                0.0,
            )
            .unwrap();
        let err = arena
            .plane_offset_union(
                sys,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                5.0,
            )
            .unwrap_err();
        assert!(
            matches!(err, UnionError::RankDeficient { .. }),
            "offsets along the same measurement direction should read as dependent rows: {err}"
        );
    }

    #[test]
    fn rejected_node_cannot_be_extended() {
        let mut arena = two_part_arena(Pose::new([0.0, 0.0, 5.0], [0.0; 3]));
        let root = arena.root();
        let sys = arena
            .plane_offset_union(
                root,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                0.0,
            )
            .unwrap();
        let err = arena
            .plane_offset_union(
                sys,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                5.0,
            )
            .unwrap_err();
        let rejected = err.rejected_system().unwrap();
        assert!(matches!(
            arena.plane_offset_union(
                rejected,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                0.0,
            ),
            Err(UnionError::RejectedParent)
        ));
    }

    #[test]
    fn refolding_from_an_earlier_node_keeps_forks_queryable() {
        let mut arena = two_part_arena(Pose::new([0.0, 0.0, 5.0], [0.0; 3]));
        let root = arena.root();
        let n1 = arena
            .plane_offset_union(
                root,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                0.0,
            )
            .unwrap();
        let n2 = arena
            .plane_offset_union(
                n1,
                plane(0, [1.0, 0.0, 0.0], [1.0, 0.0, 0.0]),
                plane(1, [-1.0, 0.0, 0.0], [-1.0, 0.0, 0.0]),
                0.0,
            )
            .unwrap();
        // Fold again from the root: a fork. The earlier chain stays intact.
        let fork = arena
            .plane_offset_union(
                root,
                plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                3.0,
            )
            .unwrap();
        assert_eq!(arena.residuals_at(n2).len(), 2);
        assert!(arena.residual_at(n2) < 1e-10);
        assert_relative_eq!(arena.x(n2)[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(arena.x(n2)[2], 2.0, epsilon = 1e-4);
        assert_eq!(arena.residuals_at(fork).len(), 1);
        assert!(arena.residual_at(fork) < 1e-10);
        assert_relative_eq!(arena.x(fork)[2], 5.0, epsilon = 1e-4);
    }
}
