//! Solve orchestration.
//!
//! Walks the declared constraints in declaration order, folds each one into
//! the growing constraint system via the Union operations its type requires,
//! and on full success commits the final pose vector back to the document.
//! On the first failure folding stops: the report names the failing
//! constraint and carries both the last-good poses and the rejected best
//! effort, leaving disposition (delete the constraint, accept the partial
//! solution) to the caller.

use tracing::{debug, info, instrument, warn};

use crate::constraint::{ConstraintDecl, ConstraintKind};
use crate::document::{ConstraintId, Document, FeatureKind, PartId};
use crate::error::SolveError;
use crate::pose::Pose;
use crate::residual::ResolvedFeature;
use crate::solver::{analyze, SolverConfig, SolverWarning};
use crate::system::{SystemArena, SystemId};
use crate::variables::VariableManager;

/// A constraint referencing a part missing from the document.
#[derive(Debug, Clone)]
pub struct BrokenConstraint {
    pub constraint: ConstraintId,
    pub name: String,
    pub missing: PartId,
}

/// Successful solve summary.
#[derive(Debug, Clone)]
pub struct SolveReport {
    /// Final sum of squared residuals.
    pub residual: f64,
    /// Remaining degrees of freedom after all constraints.
    pub dof: usize,
    pub warnings: Vec<SolverWarning>,
}

/// Failure summary: which constraint could not be satisfied, plus recovery
/// material. Nothing has been committed to the document.
#[derive(Debug, Clone)]
pub struct SolveFailure {
    pub constraint: ConstraintId,
    pub name: String,
    pub error: SolveError,
    /// Free-part poses satisfying every constraint folded before the failing
    /// one.
    pub last_good: Vec<(PartId, Pose)>,
    /// Best-effort poses from the rejected fold attempt, when a numeric solve
    /// ran at all.
    pub rejected: Option<Vec<(PartId, Pose)>>,
}

/// Result of a solve attempt that got past the pre-checks.
#[derive(Debug, Clone)]
pub enum SolveOutcome {
    /// Every constraint satisfied; poses committed.
    Solved(SolveReport),
    /// A constraint was rejected; nothing committed.
    Failed(SolveFailure),
}

/// List every constraint whose referenced parts no longer exist.
pub fn precheck<D: Document + ?Sized>(doc: &D) -> Vec<BrokenConstraint> {
    let parts = doc.parts();
    let mut broken = Vec::new();
    for c in doc.constraints() {
        for part in [c.part_a, c.part_b] {
            if !parts.iter().any(|p| p.id == part) {
                broken.push(BrokenConstraint {
                    constraint: c.id,
                    name: c.name.clone(),
                    missing: part,
                });
            }
        }
    }
    broken
}

/// Evaluate every declared constraint's residual magnitudes at the document's
/// current poses, without solving.
pub fn constraint_residuals<D: Document + ?Sized>(
    doc: &D,
) -> Result<Vec<(ConstraintId, f64)>, SolveError> {
    let parts = doc.parts();
    let vm = VariableManager::new(&parts)?;
    let x = vm.x0();
    let mut out = Vec::new();
    for decl in doc.constraints() {
        let (a, b) = resolve_pair(doc, &vm, &decl)?;
        let mut values = Vec::new();
        for residual in constraint_residual_set(&decl, a, b) {
            residual.evaluate(&vm, &x, &mut values);
        }
        let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
        out.push((decl.id, norm));
    }
    Ok(out)
}

/// Solve all declared constraints and commit the result on success.
///
/// Errors are reserved for conditions that prevent folding from starting
/// (no fixed part, broken references); failures during folding are reported
/// through [`SolveOutcome::Failed`].
#[instrument(skip(doc, config))]
pub fn solve_constraints<D: Document + ?Sized>(
    doc: &mut D,
    config: &SolverConfig,
) -> Result<SolveOutcome, SolveError> {
    let broken = precheck(doc);
    if let Some(b) = broken.first() {
        warn!(constraint = %b.constraint, missing = %b.missing, "broken constraint reference");
        return Err(SolveError::BrokenReference {
            constraint: b.constraint,
            part: b.missing,
        });
    }

    let parts = doc.parts();
    let constraints = doc.constraints();
    let vm = VariableManager::new(&parts)?;
    let mut arena = SystemArena::new(vm, config.clone());
    let mut system = arena.root();

    for decl in &constraints {
        debug!(constraint = %decl.id, name = %decl.name, "folding constraint");
        match fold_constraint(&mut arena, system, doc, decl) {
            Ok(next) => system = next,
            Err((error, rejected)) => {
                warn!(constraint = %decl.id, %error, "unable to solve constraints");
                let last_good = arena.vm().free_poses(arena.x(system));
                let rejected = rejected.map(|id| arena.vm().free_poses(arena.x(id)));
                return Ok(SolveOutcome::Failed(SolveFailure {
                    constraint: decl.id,
                    name: decl.name.clone(),
                    error,
                    last_good,
                    rejected,
                }));
            }
        }
    }

    let x = arena.x(system).to_vec();
    let residual = arena.residual_at(system);
    let active = arena.global_params();
    let residuals = arena.residuals_at(system);
    let (dof, warnings) = analyze(&residuals, arena.vm(), &x, &active);
    arena.vm().commit(&x, doc);
    info!(residual, dof, constraints = constraints.len(), "constraints solved");
    Ok(SolveOutcome::Solved(SolveReport {
        residual,
        dof,
        warnings,
    }))
}

/// Apply a set of poses (last-good or rejected) to the document, for callers
/// that choose to show a partial or rejected solution.
pub fn apply_poses<D: Document + ?Sized>(doc: &mut D, poses: &[(PartId, Pose)]) {
    for (id, pose) in poses {
        doc.set_pose(*id, *pose);
    }
}

/// Fold one declared constraint as the Union sequence its type requires.
fn fold_constraint<D: Document + ?Sized>(
    arena: &mut SystemArena,
    parent: SystemId,
    doc: &D,
    decl: &ConstraintDecl,
) -> Result<SystemId, (SolveError, Option<SystemId>)> {
    let (a, b) = resolve_pair(doc, arena.vm(), decl).map_err(|e| (e, None))?;

    let mut system = parent;
    for residual in constraint_residual_set(decl, a, b) {
        system = arena
            .union(system, residual)
            .map_err(|err| (SolveError::from_union(decl.id, &err), err.rejected_system()))?;
    }
    Ok(system)
}

/// Resolve and validate both of a constraint's feature references.
fn resolve_pair<D: Document + ?Sized>(
    doc: &D,
    vm: &VariableManager,
    decl: &ConstraintDecl,
) -> Result<(ResolvedFeature, ResolvedFeature), SolveError> {
    let ((kind_a, index_a), (kind_b, index_b)) = decl.feature_refs();
    let a = resolve_one(doc, vm, decl, decl.part_a, kind_a, index_a)?;
    let b = resolve_one(doc, vm, decl, decl.part_b, kind_b, index_b)?;
    Ok((a, b))
}

fn resolve_one<D: Document + ?Sized>(
    doc: &D,
    vm: &VariableManager,
    decl: &ConstraintDecl,
    part: PartId,
    kind: FeatureKind,
    index: usize,
) -> Result<ResolvedFeature, SolveError> {
    let part_index = vm
        .part_index(part)
        .ok_or(SolveError::BrokenReference {
            constraint: decl.id,
            part,
        })?;
    let local = doc
        .resolve_feature(part, kind, index)
        .map_err(|source| SolveError::Feature {
            constraint: decl.id,
            source,
        })?;
    ResolvedFeature::new(part_index, local).map_err(|e| SolveError::DegenerateGeometry {
        constraint: decl.id,
        reason: e.reason,
    })
}

/// The residual sequence one declared constraint folds as.
fn constraint_residual_set(
    decl: &ConstraintDecl,
    a: ResolvedFeature,
    b: ResolvedFeature,
) -> Vec<crate::residual::Residual> {
    use crate::residual::Residual;
    match &decl.kind {
        ConstraintKind::Plane {
            direction, offset, ..
        } => vec![
            Residual::AxisAlignment {
                a: a.clone(),
                b: b.clone(),
                direction: *direction,
            },
            Residual::PlaneOffset {
                a,
                b,
                offset: *offset,
            },
        ],
        ConstraintKind::Axial { direction, .. } => vec![
            Residual::AxisAlignment {
                a: a.clone(),
                b: b.clone(),
                direction: *direction,
            },
            Residual::AxisDistance {
                a,
                b,
                distance: 0.0,
            },
        ],
        ConstraintKind::AngleBetweenPlanes { degrees, .. } => vec![Residual::Angle {
            a,
            b,
            angle: degrees.to_radians(),
        }],
        ConstraintKind::CircularEdge {
            direction, offset, ..
        } => vec![
            Residual::AxisAlignment {
                a: a.clone(),
                b: b.clone(),
                direction: *direction,
            },
            Residual::AxisDistance {
                a: a.clone(),
                b: b.clone(),
                distance: 0.0,
            },
            Residual::PlaneOffset {
                a,
                b,
                offset: *offset,
            },
        ],
    }
}
