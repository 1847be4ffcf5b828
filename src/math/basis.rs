//! B-spline bases and difference penalties (P-splines).
//!
//! A P-spline smooth of `x` is a B-spline expansion with `k` basis functions
//! on equally spaced knots plus a penalty on `order`-th differences of
//! adjacent coefficients:
//!
//! - `B(x)`: Cox–de Boor recursion, one row per observation
//! - `S = DᵀD`: difference penalty
//! - `Z`: Householder reparameterisation enforcing `Σ_i f(x_i) = 0` on the
//!   training data, so the smooth is identifiable next to an intercept
//!
//! Numerical notes:
//! - Knots extend `degree` segments beyond the data range, so the basis is a
//!   partition of unity on the closed range `[lo, hi]` (no special case at `hi`).
//! - Values outside the range are clamped to it before evaluation.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SurveyIndexError};

/// Cubic splines throughout.
pub const SPLINE_DEGREE: usize = 3;

/// Second-order difference penalty throughout.
pub const PENALTY_ORDER: usize = 2;

/// Full knot vector for `n_basis` B-splines of `degree` on `[lo, hi]`.
pub fn uniform_knots(lo: f64, hi: f64, n_basis: usize, degree: usize) -> Result<Vec<f64>> {
    if !(lo.is_finite() && hi.is_finite()) {
        return Err(SurveyIndexError::Numerical(format!(
            "non-finite spline range [{lo}, {hi}]"
        )));
    }
    if n_basis <= degree {
        return Err(SurveyIndexError::Formula(format!(
            "basis dimension {n_basis} must exceed the spline degree {degree}"
        )));
    }

    // A degenerate range (constant covariate) still needs a valid knot grid.
    let (lo, hi) = if hi > lo { (lo, hi) } else { (lo - 0.5, lo + 0.5) };

    let segments = n_basis - degree;
    let h = (hi - lo) / segments as f64;
    let n_knots = n_basis + degree + 1;
    Ok((0..n_knots)
        .map(|i| lo + (i as f64 - degree as f64) * h)
        .collect())
}

/// Full knot vector from user-supplied breakpoints `[lo, ..., hi]`.
///
/// The first and last segment widths are repeated `degree` times outwards.
/// The resulting basis has `breaks.len() - 1 + degree` functions.
pub fn knots_from_breaks(breaks: &[f64], degree: usize) -> Result<Vec<f64>> {
    if breaks.len() < 2 {
        return Err(SurveyIndexError::Formula(
            "explicit knots need at least two breakpoints".to_string(),
        ));
    }
    if breaks.iter().any(|b| !b.is_finite()) || breaks.windows(2).any(|w| w[1] <= w[0]) {
        return Err(SurveyIndexError::Formula(
            "explicit knots must be finite and strictly increasing".to_string(),
        ));
    }

    let first = breaks[1] - breaks[0];
    let last = breaks[breaks.len() - 1] - breaks[breaks.len() - 2];

    let mut knots = Vec::with_capacity(breaks.len() + 2 * degree);
    for i in (1..=degree).rev() {
        knots.push(breaks[0] - i as f64 * first);
    }
    knots.extend_from_slice(breaks);
    let hi = breaks[breaks.len() - 1];
    for i in 1..=degree {
        knots.push(hi + i as f64 * last);
    }
    Ok(knots)
}

/// Number of basis functions defined by a full knot vector.
pub fn basis_len(knots: &[f64], degree: usize) -> usize {
    knots.len().saturating_sub(degree + 1)
}

/// Range `[lo, hi]` covered by a full knot vector.
pub fn knot_range(knots: &[f64], degree: usize) -> (f64, f64) {
    (knots[degree], knots[knots.len() - 1 - degree])
}

/// Evaluate all B-splines at `x` (Cox–de Boor).
pub fn bspline_row(x: f64, knots: &[f64], degree: usize) -> Vec<f64> {
    let (lo, hi) = knot_range(knots, degree);
    let x = x.clamp(lo, hi);

    let m = knots.len();
    let mut b = vec![0.0; m - 1];
    for i in 0..m - 1 {
        if knots[i] <= x && x < knots[i + 1] {
            b[i] = 1.0;
        }
    }

    // Raise the degree in place; b[i] only reads b[i] and b[i + 1].
    for d in 1..=degree {
        for i in 0..m - 1 - d {
            let left_den = knots[i + d] - knots[i];
            let right_den = knots[i + d + 1] - knots[i + 1];
            let left = if left_den > 0.0 {
                (x - knots[i]) / left_den * b[i]
            } else {
                0.0
            };
            let right = if right_den > 0.0 {
                (knots[i + d + 1] - x) / right_den * b[i + 1]
            } else {
                0.0
            };
            b[i] = left + right;
        }
    }

    b.truncate(basis_len(knots, degree));
    b
}

/// Difference penalty `S = DᵀD` for `n` coefficients.
pub fn difference_penalty(n: usize, order: usize) -> Result<DMatrix<f64>> {
    if order == 0 || order >= n {
        return Err(SurveyIndexError::Formula(format!(
            "penalty order {order} must be positive and below the basis dimension {n}"
        )));
    }

    let mut d = DMatrix::<f64>::identity(n, n);
    for _ in 0..order {
        let rows = d.nrows();
        d = DMatrix::from_fn(rows - 1, n, |i, j| d[(i + 1, j)] - d[(i, j)]);
    }
    Ok(d.transpose() * d)
}

/// Null-space basis `Z` (k × (k−1)) of the constraint `cᵀβ = 0`.
///
/// Built from the Householder reflection mapping `c` onto the first axis;
/// the remaining columns of the reflector are orthonormal and orthogonal to `c`.
pub fn constraint_null_space(c: &DVector<f64>) -> Result<DMatrix<f64>> {
    let k = c.len();
    let norm = c.norm();
    if k < 2 || !(norm.is_finite() && norm > 0.0) {
        return Err(SurveyIndexError::Numerical(
            "cannot build a sum-to-zero constraint from an empty basis".to_string(),
        ));
    }

    let sign = if c[0] >= 0.0 { 1.0 } else { -1.0 };
    let mut v = c.clone();
    v[0] += sign * norm;
    let vv = v.dot(&v);
    let h = DMatrix::<f64>::identity(k, k) - (&v * v.transpose()) * (2.0 / vv);
    Ok(h.columns(1, k - 1).into_owned())
}

/// Kronecker product `a ⊗ b`.
pub fn kronecker(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    let (ar, ac) = a.shape();
    let (br, bc) = b.shape();
    DMatrix::from_fn(ar * br, ac * bc, |i, j| {
        a[(i / br, j / bc)] * b[(i % br, j % bc)]
    })
}

/// Row-wise Kronecker product of two basis rows.
pub fn kronecker_row(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(a.len() * b.len());
    for &x in a {
        for &y in b {
            out.push(x * y);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basis_is_partition_of_unity_on_range() {
        let knots = uniform_knots(0.0, 10.0, 8, SPLINE_DEGREE).unwrap();
        assert_eq!(basis_len(&knots, SPLINE_DEGREE), 8);
        for &x in &[0.0, 0.3, 2.5, 5.0, 9.99, 10.0] {
            let row = bspline_row(x, &knots, SPLINE_DEGREE);
            assert_eq!(row.len(), 8);
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "sum at {x} was {sum}");
            assert!(row.iter().all(|v| *v >= 0.0));
        }
    }

    #[test]
    fn values_outside_range_are_clamped() {
        let knots = uniform_knots(0.0, 1.0, 6, SPLINE_DEGREE).unwrap();
        assert_eq!(bspline_row(-5.0, &knots, SPLINE_DEGREE), bspline_row(0.0, &knots, SPLINE_DEGREE));
        assert_eq!(bspline_row(7.0, &knots, SPLINE_DEGREE), bspline_row(1.0, &knots, SPLINE_DEGREE));
    }

    #[test]
    fn explicit_breaks_define_basis_size() {
        let knots = knots_from_breaks(&[0.0, 1.0, 3.0, 4.0], SPLINE_DEGREE).unwrap();
        assert_eq!(basis_len(&knots, SPLINE_DEGREE), 3 + SPLINE_DEGREE);
        assert_eq!(knot_range(&knots, SPLINE_DEGREE), (0.0, 4.0));
        let sum: f64 = bspline_row(2.0, &knots, SPLINE_DEGREE).iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(knots_from_breaks(&[1.0, 1.0], SPLINE_DEGREE).is_err());
    }

    #[test]
    fn difference_penalty_annihilates_linear_coefficients() {
        let s = difference_penalty(6, 2).unwrap();
        let linear = DVector::from_fn(6, |i, _| 2.0 + 0.5 * i as f64);
        assert!((&s * &linear).norm() < 1e-12);
        assert!(difference_penalty(3, 3).is_err());
    }

    #[test]
    fn null_space_is_orthogonal_to_constraint() {
        let c = DVector::from_vec(vec![3.0, 1.0, 4.0, 1.5]);
        let z = constraint_null_space(&c).unwrap();
        assert_eq!(z.shape(), (4, 3));
        assert!((c.transpose() * &z).norm() < 1e-12);
        let gram = z.transpose() * &z;
        assert!((gram - DMatrix::<f64>::identity(3, 3)).norm() < 1e-12);
    }

    #[test]
    fn kronecker_shapes_and_values() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = DMatrix::<f64>::identity(2, 2);
        let k = kronecker(&a, &b);
        assert_eq!(k.shape(), (4, 4));
        assert_eq!(k[(0, 2)], 2.0);
        assert_eq!(k[(3, 1)], 3.0);
        assert_eq!(kronecker_row(&[1.0, 2.0], &[3.0, 4.0]), vec![3.0, 4.0, 6.0, 8.0]);
    }
}
