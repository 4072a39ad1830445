//! Constraint residual families.
//!
//! Each residual closes over a resolved feature pair and its parameters and
//! evaluates scalar equations against a candidate pose vector. Feature
//! geometry is stored body-local, so the world primitives are recomputed from
//! the current pose hypothesis at every evaluation.

use nalgebra::Vector3;

use crate::constraint::DirectionOption;
use crate::document::LocalFeature;
use crate::variables::VariableManager;

/// Minimum length for a usable normal or axis direction.
const MIN_DIRECTION_NORM: f64 = 1e-9;

/// A feature reference resolved to body-local geometry, with its part mapped
/// to a [`VariableManager`] index and its direction normalized.
#[derive(Debug, Clone)]
pub struct ResolvedFeature {
    pub part: usize,
    pub local: LocalFeature,
}

impl ResolvedFeature {
    /// Normalize the feature's direction, rejecting degenerate geometry
    /// (zero-length axis or normal) as a solver input error.
    pub fn new(part: usize, local: LocalFeature) -> Result<Self, DegenerateFeature> {
        let d = Vector3::from(local.direction());
        let n = d.norm();
        if n < MIN_DIRECTION_NORM {
            return Err(DegenerateFeature {
                reason: match local {
                    LocalFeature::Plane { .. } => "zero-length plane normal".to_string(),
                    LocalFeature::Axis { .. } => "zero-length axis direction".to_string(),
                },
            });
        }
        let unit: [f64; 3] = (d / n).into();
        let local = match local {
            LocalFeature::Plane { point, .. } => LocalFeature::Plane {
                point,
                normal: unit,
            },
            LocalFeature::Axis { point, radius, .. } => LocalFeature::Axis {
                point,
                direction: unit,
                radius,
            },
        };
        Ok(Self { part, local })
    }
}

/// A feature resolved to an unusable primitive.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct DegenerateFeature {
    pub reason: String,
}

/// One folded constraint's residual equations.
#[derive(Debug, Clone)]
pub enum Residual {
    /// Angular misalignment of two directions: the signed components of
    /// a x b (first order in the misalignment angle), plus a dot-product
    /// term selecting the sense (`Aligned` drives it to 1, `Opposed` to -1).
    /// `None` contributes no equation.
    AxisAlignment {
        a: ResolvedFeature,
        b: ResolvedFeature,
        direction: DirectionOption,
    },
    /// Signed distance between two planes along the first normal, minus the
    /// requested offset.
    PlaneOffset {
        a: ResolvedFeature,
        b: ResolvedFeature,
        offset: f64,
    },
    /// Angle between two plane normals minus the requested angle (radians).
    Angle {
        a: ResolvedFeature,
        b: ResolvedFeature,
        angle: f64,
    },
    /// Perpendicular separation between two axes. A zero target (collinear
    /// axes) is expressed as the signed components of sep x d_a, which remain
    /// differentiable at the solution; a nonzero target uses the separation
    /// magnitude minus the distance, whose kink at zero is then never
    /// reached.
    AxisDistance {
        a: ResolvedFeature,
        b: ResolvedFeature,
        distance: f64,
    },
}

impl Residual {
    /// The two parts this residual touches.
    pub fn parts(&self) -> (usize, usize) {
        match self {
            Residual::AxisAlignment { a, b, .. }
            | Residual::PlaneOffset { a, b, .. }
            | Residual::Angle { a, b, .. }
            | Residual::AxisDistance { a, b, .. } => (a.part, b.part),
        }
    }

    /// Number of scalar equations this residual contributes.
    pub fn equation_count(&self) -> usize {
        match self {
            Residual::AxisAlignment { direction, .. } => match direction {
                DirectionOption::None => 0,
                _ => 4,
            },
            Residual::AxisDistance { distance, .. } => {
                if *distance == 0.0 {
                    3
                } else {
                    1
                }
            }
            _ => 1,
        }
    }

    /// Append this residual's equations evaluated at `x`.
    pub fn evaluate(&self, vm: &VariableManager, x: &[f64], out: &mut Vec<f64>) {
        match self {
            Residual::AxisAlignment { a, b, direction } => {
                if *direction == DirectionOption::None {
                    return;
                }
                let wa = vm.evaluate(x, a.part, &a.local);
                let wb = vm.evaluate(x, b.part, &b.local);
                // a x b vanishes first-order at both parallel and antiparallel;
                // the dot term rules out the wrong sense.
                let cross = wa.direction.cross(&wb.direction);
                out.push(cross.x);
                out.push(cross.y);
                out.push(cross.z);
                let dot = wa.direction.dot(&wb.direction);
                out.push(match direction {
                    DirectionOption::Aligned => dot - 1.0,
                    DirectionOption::Opposed => dot + 1.0,
                    DirectionOption::None => unreachable!(),
                });
            }
            Residual::PlaneOffset { a, b, offset } => {
                let wa = vm.evaluate(x, a.part, &a.local);
                let wb = vm.evaluate(x, b.part, &b.local);
                out.push((wb.point - wa.point).dot(&wa.direction) - offset);
            }
            Residual::Angle { a, b, angle } => {
                let wa = vm.evaluate(x, a.part, &a.local);
                let wb = vm.evaluate(x, b.part, &b.local);
                let theta = wa
                    .direction
                    .cross(&wb.direction)
                    .norm()
                    .atan2(wa.direction.dot(&wb.direction));
                out.push(theta - angle);
            }
            Residual::AxisDistance { a, b, distance } => {
                let wa = vm.evaluate(x, a.part, &a.local);
                let wb = vm.evaluate(x, b.part, &b.local);
                let sep = wb.point - wa.point;
                let cross = sep.cross(&wa.direction);
                if *distance == 0.0 {
                    out.push(cross.x);
                    out.push(cross.y);
                    out.push(cross.z);
                } else {
                    out.push(cross.norm() - distance);
                }
            }
        }
    }
}

/// Evaluate a residual set into a fresh vector.
pub fn collect_residuals(residuals: &[Residual], vm: &VariableManager, x: &[f64]) -> Vec<f64> {
    let mut out = Vec::new();
    for r in residuals {
        r.evaluate(vm, x, &mut out);
    }
    out
}
