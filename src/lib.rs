//! Incremental geometric constraint solver for rigid 3-D assemblies.
//!
//! Positions parts so that declared constraints (plane coincidence, axial
//! alignment, angle between planes, circular-edge alignment) hold
//! simultaneously. Constraints are folded in one at a time: each fold first
//! tries a cheap local solve that repositions a single part, escalating to a
//! global solve over every non-fixed part only when that fails. The numeric
//! core is a Gauss-Newton solver with Levenberg-Marquardt damping over 6-DOF
//! rigid-body poses (translation + axis-angle rotation).
//!
//! The host document model is consumed through the [`document::Document`]
//! trait; the solver reads snapshots, solves, and commits poses back in a
//! single explicit step on full success.

pub mod constraint;
pub mod document;
pub mod error;
pub mod mock;
pub mod pose;
pub mod residual;
pub mod solve;
pub mod solver;
pub mod system;
pub mod variables;

pub use constraint::{ConstraintDecl, ConstraintKind, DirectionOption};
pub use document::{
    ConstraintId, Document, FeatureError, FeatureKind, LocalFeature, Part, PartId,
};
pub use error::{SolveError, UnionError};
pub use mock::MockDocument;
pub use pose::Pose;
pub use residual::{Residual, ResolvedFeature};
pub use solve::{
    apply_poses, constraint_residuals, precheck, solve_constraints, BrokenConstraint,
    SolveFailure, SolveOutcome, SolveReport,
};
pub use solver::{SolverConfig, SolverWarning};
pub use system::{SystemArena, SystemId, SystemState};
pub use variables::VariableManager;
