//! Dense symmetric positive-definite solves.
//!
//! Every penalised fit in this project reduces to systems of the form
//!
//! ```text
//! (XᵀWX + Σ λ_j S_j) β = XᵀWz
//! ```
//!
//! which are symmetric and, with the penalties in place, positive definite in
//! exact arithmetic. In floating point a factor level with no information or
//! an unpenalised null space can make them numerically semi-definite, so we
//! retry the Cholesky factorisation with progressively larger diagonal jitter.

use nalgebra::{Cholesky, DMatrix, Dyn};

/// Relative diagonal jitter tried in order until the factorisation succeeds.
const JITTER_STEPS: [f64; 5] = [0.0, 1e-12, 1e-10, 1e-8, 1e-6];

/// Cholesky factor of a symmetric matrix, retrying with diagonal jitter.
///
/// Returns `None` if the matrix is not positive definite even after the
/// largest jitter, or contains non-finite values.
pub fn spd_factor(a: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    if a.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let n = a.nrows();
    let scale = if n == 0 {
        1.0
    } else {
        (a.diagonal().iter().map(|v| v.abs()).sum::<f64>() / n as f64).max(1e-12)
    };

    for &rel in &JITTER_STEPS {
        let mut m = a.clone();
        if rel > 0.0 {
            for i in 0..n {
                m[(i, i)] += rel * scale;
            }
        }
        if let Some(chol) = Cholesky::new(m) {
            return Some(chol);
        }
    }

    None
}

/// `(m + mᵀ) / 2`.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    #[test]
    fn solves_simple_spd_system() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let x = spd_factor(&a).unwrap().solve(&b);
        assert!((&a * &x - &b).norm() < 1e-12);
    }

    #[test]
    fn jitter_rescues_semidefinite_matrix() {
        // Rank one: [1 1; 1 1].
        let a = DMatrix::from_element(2, 2, 1.0);
        assert!(spd_factor(&a).is_some());
    }

    #[test]
    fn rejects_indefinite_and_non_finite() {
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        assert!(spd_factor(&indefinite).is_none());
        let nan = DMatrix::from_row_slice(1, 1, &[f64::NAN]);
        assert!(spd_factor(&nan).is_none());
    }

    #[test]
    fn inverse_is_symmetric() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let inv = symmetrize(&spd_factor(&a).unwrap().inverse());
        assert!((&inv - inv.transpose()).norm() < 1e-15);
        assert!((&a * &inv - DMatrix::<f64>::identity(3, 3)).norm() < 1e-10);
    }
}
