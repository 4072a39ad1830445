//! Solver error kinds.
//!
//! Union-level failures ([`UnionError`]) carry no constraint identity; the
//! orchestrator wraps them into [`SolveError`], which always names the
//! offending constraint so callers can report or delete it.

use crate::document::{ConstraintId, FeatureError, PartId};
use crate::system::SystemId;

/// A failure while folding one constraint into the system.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnionError {
    #[error("solver did not converge after {iterations} iterations (residual {residual:.3e})")]
    NotConverged {
        iterations: usize,
        residual: f64,
        /// The rejected system holding the best iterate reached.
        rejected: SystemId,
    },

    #[error("singular Jacobian: constraints are redundant or contradictory")]
    RankDeficient { rejected: SystemId },

    #[error("cannot extend a rejected constraint system")]
    RejectedParent,
}

impl UnionError {
    /// The rejected system produced by the failed fold, if one was recorded.
    pub fn rejected_system(&self) -> Option<SystemId> {
        match self {
            UnionError::NotConverged { rejected, .. }
            | UnionError::RankDeficient { rejected, .. } => Some(*rejected),
            UnionError::RejectedParent => None,
        }
    }
}

/// Top-level solve failure, attributed to a constraint where one is involved.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolveError {
    /// No part has `fixed_position` set; raised before any folding begins.
    #[error("constraint solving requires at least one part with fixed_position set")]
    NoFixedPart,

    /// A constraint references a part missing from the document.
    #[error("constraint {constraint} references missing part {part}")]
    BrokenReference {
        constraint: ConstraintId,
        part: PartId,
    },

    /// The host's feature query failed for a constraint's feature reference.
    #[error("constraint {constraint}: feature query failed: {source}")]
    Feature {
        constraint: ConstraintId,
        #[source]
        source: FeatureError,
    },

    /// A feature resolved to an unusable primitive (e.g. zero-length axis).
    #[error("constraint {constraint}: degenerate feature geometry: {reason}")]
    DegenerateGeometry {
        constraint: ConstraintId,
        reason: String,
    },

    /// Neither the local nor the global solve reached tolerance.
    #[error(
        "constraint {constraint}: solver did not converge after {iterations} iterations \
         (residual {residual:.3e})"
    )]
    ConvergenceFailure {
        constraint: ConstraintId,
        iterations: usize,
        residual: f64,
    },

    /// The Jacobian went singular during the fold.
    #[error("constraint {constraint}: singular Jacobian, constraints are redundant or contradictory")]
    RankDeficient { constraint: ConstraintId },
}

impl SolveError {
    /// Attribute a union failure to the constraint being folded.
    pub(crate) fn from_union(constraint: ConstraintId, err: &UnionError) -> Self {
        match err {
            UnionError::NotConverged {
                iterations,
                residual,
                ..
            } => SolveError::ConvergenceFailure {
                constraint,
                iterations: *iterations,
                residual: *residual,
            },
            UnionError::RankDeficient { .. } | UnionError::RejectedParent => {
                SolveError::RankDeficient { constraint }
            }
        }
    }
}
