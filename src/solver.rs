//! Iterative nonlinear least-squares solver.
//!
//! Gauss-Newton with Levenberg-Marquardt damping over a variable subset: the
//! Jacobian is built by finite differences on the active columns only, and the
//! damped normal equations (J^T J + lambda I) dx = J^T r are solved by Gaussian
//! elimination with partial pivoting. Analytic derivatives of the axis-angle
//! rotation are messy and these systems are small, so finite differences are
//! the pragmatic choice.

use nalgebra::{DMatrix, SVD};
use tracing::trace;

use crate::residual::{collect_residuals, Residual};
use crate::variables::VariableManager;

/// Solver configuration.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Iteration cap; bounds solve latency on non-convergent systems.
    pub max_iterations: usize,
    /// Convergence threshold on the sum of squared residuals.
    pub tolerance: f64,
    /// Accepted steps smaller than this are treated as a stall.
    pub step_tolerance: f64,
    pub lambda_initial: f64,
    pub lambda_factor: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
            step_tolerance: 1e-12,
            lambda_initial: 1e-3,
            lambda_factor: 10.0,
        }
    }
}

/// Outcome of one numeric solve. On non-convergence `x` holds the best
/// iterate reached, letting the caller decide to escalate or reject.
#[derive(Debug, Clone)]
pub struct SolverOutput {
    pub converged: bool,
    pub iterations: usize,
    /// Final sum of squared residuals.
    pub residual: f64,
    pub x: Vec<f64>,
    /// Set when a singular normal-equations matrix or a non-finite residual
    /// was encountered; with `converged == false` this indicates rank
    /// deficiency rather than a plain convergence failure.
    pub rank_deficient: bool,
}

/// Diagnostic warnings from the Jacobian rank analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverWarning {
    /// More equations than the Jacobian's rank supports.
    OverConstrained { redundant: usize },
    /// Degrees of freedom remain unconstrained.
    UnderConstrained { dof: usize },
}

/// Minimize the residual set over the active columns of X starting from `x0`.
/// Columns not in `active` are held at their `x0` values.
pub fn solve(
    residuals: &[Residual],
    vm: &VariableManager,
    x0: &[f64],
    active: &[usize],
    config: &SolverConfig,
) -> SolverOutput {
    let mut x = x0.to_vec();
    let k = active.len();

    let initial = sum_squares(&collect_residuals(residuals, vm, &x));
    if k == 0 || residuals.iter().all(|r| r.equation_count() == 0) {
        return SolverOutput {
            converged: initial < config.tolerance,
            iterations: 0,
            residual: initial,
            x,
            rank_deficient: false,
        };
    }

    let mut lambda = config.lambda_initial;
    let mut rank_deficient = false;
    let mut completed = 0;

    for iteration in 0..config.max_iterations {
        completed = iteration + 1;
        let r = collect_residuals(residuals, vm, &x);
        if r.iter().any(|v| !v.is_finite()) {
            return SolverOutput {
                converged: false,
                iterations: iteration,
                residual: f64::INFINITY,
                x,
                rank_deficient: true,
            };
        }
        let total_sq = sum_squares(&r);
        if total_sq < config.tolerance {
            return SolverOutput {
                converged: true,
                iterations: iteration,
                residual: total_sq,
                x,
                rank_deficient: false,
            };
        }

        let m = r.len();
        let jac = build_jacobian(residuals, vm, &x, active, &r);

        // J^T r and J^T J over the active columns.
        let mut jtr = vec![0.0; k];
        for j in 0..k {
            for i in 0..m {
                jtr[j] += jac[i * k + j] * r[i];
            }
        }
        let mut jtj = vec![0.0; k * k];
        for a in 0..k {
            for b in 0..k {
                let mut sum = 0.0;
                for i in 0..m {
                    sum += jac[i * k + a] * jac[i * k + b];
                }
                jtj[a * k + b] = sum;
            }
        }

        // Damped step with adaptive lambda.
        let mut accepted_step: Option<f64> = None;
        for _ in 0..10 {
            let mut damped = jtj.clone();
            for i in 0..k {
                damped[i * k + i] += lambda;
            }
            match solve_linear_system(&damped, &jtr, k) {
                Some(dx) => {
                    let mut candidate = x.clone();
                    for (slot, &col) in dx.iter().zip(active) {
                        candidate[col] -= slot;
                    }
                    let new_sq = sum_squares(&collect_residuals(residuals, vm, &candidate));
                    if new_sq.is_finite() && new_sq < total_sq {
                        x = candidate;
                        lambda = (lambda / config.lambda_factor).max(1e-15);
                        accepted_step = Some(sum_squares(&dx).sqrt());
                        // A singular attempt at an earlier lambda is moot once
                        // a damped step goes through.
                        rank_deficient = false;
                        break;
                    }
                }
                None => {
                    rank_deficient = true;
                }
            }
            lambda *= config.lambda_factor;
        }

        match accepted_step {
            Some(step) if step < config.step_tolerance => {
                // Stalled short of tolerance.
                trace!(iteration, step, residual = total_sq, "solver stalled");
                break;
            }
            Some(_) => {}
            None => {
                // Fall back to a small gradient step, as the damped system
                // keeps rejecting.
                let grad_sq = sum_squares(&jtr);
                if grad_sq < 1e-20 {
                    break;
                }
                let step = 0.01 / grad_sq.sqrt();
                for (slot, &col) in jtr.iter().zip(active) {
                    x[col] -= step * slot;
                }
                lambda *= config.lambda_factor;
            }
        }
    }

    let residual = sum_squares(&collect_residuals(residuals, vm, &x));
    SolverOutput {
        converged: residual < config.tolerance,
        iterations: completed,
        residual,
        x,
        rank_deficient,
    }
}

/// Whether the residual Jacobian at `x` has linearly dependent rows, the
/// signature of redundant or mutually contradictory equations.
pub fn rows_rank_deficient(
    residuals: &[Residual],
    vm: &VariableManager,
    x: &[f64],
    active: &[usize],
) -> bool {
    let r = collect_residuals(residuals, vm, x);
    let m = r.len();
    if m == 0 || active.is_empty() {
        return false;
    }
    let jac = build_jacobian(residuals, vm, x, active, &r);
    jacobian_rank(&jac, m, active.len()) < m
}

/// Rank analysis of the residual Jacobian at `x`: remaining degrees of
/// freedom plus over/under-constrained warnings.
pub fn analyze(
    residuals: &[Residual],
    vm: &VariableManager,
    x: &[f64],
    active: &[usize],
) -> (usize, Vec<SolverWarning>) {
    let k = active.len();
    let mut warnings = Vec::new();
    let r = collect_residuals(residuals, vm, x);
    let m = r.len();
    if k == 0 || m == 0 {
        return (k, warnings);
    }
    let jac = build_jacobian(residuals, vm, x, active, &r);
    let rank = jacobian_rank(&jac, m, k);
    let dof = k.saturating_sub(rank);
    if m > rank {
        warnings.push(SolverWarning::OverConstrained { redundant: m - rank });
    }
    if dof > 0 {
        warnings.push(SolverWarning::UnderConstrained { dof });
    }
    (dof, warnings)
}

fn sum_squares(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum()
}

/// Forward-difference Jacobian, row-major [m x active.len()].
fn build_jacobian(
    residuals: &[Residual],
    vm: &VariableManager,
    x: &[f64],
    active: &[usize],
    base: &[f64],
) -> Vec<f64> {
    let h = 1e-7;
    let m = base.len();
    let k = active.len();
    let mut jac = vec![0.0; m * k];
    let mut perturbed = x.to_vec();
    for (j, &col) in active.iter().enumerate() {
        let orig = perturbed[col];
        perturbed[col] = orig + h;
        let r_plus = collect_residuals(residuals, vm, &perturbed);
        perturbed[col] = orig;
        for i in 0..m {
            jac[i * k + j] = (r_plus[i] - base[i]) / h;
        }
    }
    jac
}

/// Numerical rank of a row-major [m x n] matrix via SVD.
fn jacobian_rank(jac: &[f64], m: usize, n: usize) -> usize {
    let mat = DMatrix::from_row_slice(m, n, jac);
    let svd = SVD::new(mat, false, false);
    let sv = &svd.singular_values;
    let max_sv = sv.iter().cloned().fold(0.0_f64, f64::max);
    let threshold = max_sv * (m.max(n) as f64) * f64::EPSILON;
    sv.iter().filter(|&&s| s > threshold).count()
}

/// Solve A x = b for square row-major A by Gaussian elimination with partial
/// pivoting. Returns None on a (near-)singular pivot.
fn solve_linear_system(a: &[f64], b: &[f64], n: usize) -> Option<Vec<f64>> {
    let w = n + 1;
    let mut aug = vec![0.0; n * w];
    for i in 0..n {
        aug[i * w..i * w + n].copy_from_slice(&a[i * n..(i + 1) * n]);
        aug[i * w + n] = b[i];
    }

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&r1, &r2| {
                aug[r1 * w + col]
                    .abs()
                    .total_cmp(&aug[r2 * w + col].abs())
            })
            .unwrap_or(col);
        if aug[pivot_row * w + col].abs() < 1e-15 {
            return None;
        }
        if pivot_row != col {
            for j in 0..w {
                aug.swap(col * w + j, pivot_row * w + j);
            }
        }
        let pivot = aug[col * w + col];
        for row in (col + 1)..n {
            let factor = aug[row * w + col] / pivot;
            for j in col..w {
                aug[row * w + j] -= factor * aug[col * w + j];
            }
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = aug[i * w + n];
        for j in (i + 1)..n {
            sum -= aug[i * w + j] * x[j];
        }
        let diag = aug[i * w + i];
        if diag.abs() < 1e-15 {
            return None;
        }
        x[i] = sum / diag;
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::DirectionOption;
    use crate::document::{LocalFeature, Part};
    use crate::pose::Pose;
    use crate::residual::ResolvedFeature;
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

    #[test]
    fn solve_linear_system_solves_small_system() {
        // 2x + y = 5, x + 3y = 10
        let a = vec![2.0, 1.0, 1.0, 3.0];
        let b = vec![5.0, 10.0];
        let x = solve_linear_system(&a, &b, 2).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn solve_linear_system_rejects_singular_matrix() {
        let a = vec![1.0, 2.0, 2.0, 4.0];
        let b = vec![1.0, 2.0];
        assert!(solve_linear_system(&a, &b, 2).is_none());
    }

    #[test]
    fn plane_coincidence_moves_free_part_onto_plane() {
        let parts = vec![
            part("base", Pose::identity(), true),
            part("free", Pose::new([0.0, 0.0, 5.0], [0.0; 3]), false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        let residuals = vec![Residual::PlaneOffset {
            a: plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
            b: plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
            offset: 0.0,
        }];
        let active: Vec<usize> = (0..6).collect();
        let out = solve(&residuals, &vm, &vm.x0(), &active, &SolverConfig::default());
        assert!(out.converged, "residual {}", out.residual);
        // Free part's base must land at z = 2.
        assert_relative_eq!(out.x[2], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn empty_active_set_reports_convergence_state_without_moving() {
        let parts = vec![
            part("base", Pose::identity(), true),
            part("free", Pose::new([0.0, 0.0, 2.0], [0.0; 3]), false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        let residuals = vec![Residual::PlaneOffset {
            a: plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
            b: plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
            offset: 0.0,
        }];
        let out = solve(&residuals, &vm, &vm.x0(), &[], &SolverConfig::default());
        assert_eq!(out.iterations, 0);
        assert!(out.converged);
        assert_eq!(out.x, vm.x0());
    }

    #[test]
    fn stalled_solve_reports_actual_iteration_count() {
        let parts = vec![
            part("base", Pose::identity(), true),
            part("free", Pose::new([0.0, 0.0, 5.0], [0.0; 3]), false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        // Two offsets along the same normal that cannot hold at once: the
        // solver reaches the least-squares compromise in a step or two and
        // stalls there.
        let residuals = vec![
            Residual::PlaneOffset {
                a: plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                b: plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                offset: 0.0,
            },
            Residual::PlaneOffset {
                a: plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                b: plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                offset: 5.0,
            },
        ];
        let config = SolverConfig::default();
        let active: Vec<usize> = (0..6).collect();
        let out = solve(&residuals, &vm, &vm.x0(), &active, &config);
        assert!(!out.converged);
        assert!(
            out.iterations < config.max_iterations,
            "stall should end the solve early, ran {} iterations",
            out.iterations
        );
        assert!(out.residual > 1.0, "compromise residual {}", out.residual);
        assert!(!out.rank_deficient);
    }

    #[test]
    fn contradictory_offsets_have_dependent_rows() {
        let parts = vec![
            part("base", Pose::identity(), true),
            part("free", Pose::new([0.0, 0.0, 5.0], [0.0; 3]), false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        let residuals = vec![
            Residual::PlaneOffset {
                a: plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                b: plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                offset: 0.0,
            },
            Residual::PlaneOffset {
                a: plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
                b: plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
                offset: 5.0,
            },
        ];
        let active: Vec<usize> = (0..6).collect();
        assert!(rows_rank_deficient(&residuals, &vm, &vm.x0(), &active));
    }

    #[test]
    fn analyze_reports_under_constrained_dof() {
        let parts = vec![
            part("base", Pose::identity(), true),
            part("free", Pose::new([0.0, 0.0, 2.0], [0.0; 3]), false),
        ];
        let vm = VariableManager::new(&parts).unwrap();
        let residuals = vec![Residual::PlaneOffset {
            a: plane(0, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
            b: plane(1, [0.0, 0.0, -1.0], [0.0, 0.0, -1.0]),
            offset: 0.0,
        }];
        let active: Vec<usize> = (0..6).collect();
        let (dof, warnings) = analyze(&residuals, &vm, &vm.x0(), &active);
        assert!(dof >= 5, "one plane equation leaves most of 6 dof: {dof}");
        assert!(warnings
            .iter()
            .any(|w| matches!(w, SolverWarning::UnderConstrained { .. })));
    }
}
