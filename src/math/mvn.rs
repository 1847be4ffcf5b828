//! Multivariate normal draws for coefficient simulation.
//!
//! Posterior covariance matrices of penalised fits are often numerically
//! rank-deficient (shrunk smooths, random effects with tiny variance), so a
//! Cholesky factor is not always available. We factor through the symmetric
//! eigendecomposition instead, `Σ = V Λ Vᵀ`, and draw `μ + V Λ^{1/2} z`,
//! clamping tiny negative eigenvalues to zero.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Result, SurveyIndexError};
use crate::math::linalg::symmetrize;

/// Relative tolerance for negative eigenvalues.
const EIGEN_TOL: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct MultivariateNormal {
    mean: DVector<f64>,
    factor: DMatrix<f64>,
}

impl MultivariateNormal {
    pub fn new(mean: DVector<f64>, cov: &DMatrix<f64>) -> Result<Self> {
        let p = mean.len();
        if cov.shape() != (p, p) {
            return Err(SurveyIndexError::Numerical(format!(
                "covariance is {}x{} but the mean has length {p}",
                cov.nrows(),
                cov.ncols()
            )));
        }
        if cov.iter().chain(mean.iter()).any(|v| !v.is_finite()) {
            return Err(SurveyIndexError::Numerical(
                "non-finite coefficient mean or covariance".to_string(),
            ));
        }

        let eig = SymmetricEigen::new(symmetrize(cov));
        let max_ev = eig.eigenvalues.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if eig.eigenvalues.iter().any(|&ev| ev < -EIGEN_TOL * max_ev) {
            return Err(SurveyIndexError::Numerical(
                "coefficient covariance is not positive semi-definite".to_string(),
            ));
        }

        let mut factor = eig.eigenvectors;
        for (j, ev) in eig.eigenvalues.iter().enumerate() {
            let s = ev.max(0.0).sqrt();
            factor.column_mut(j).scale_mut(s);
        }

        Ok(Self { mean, factor })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// `n` draws as the columns of a `dim × n` matrix.
    pub fn sample_columns<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> DMatrix<f64> {
        let z = DMatrix::from_fn(self.dim(), n, |_, _| rng.sample::<f64, _>(StandardNormal));
        let mut draws = &self.factor * z;
        for mut col in draws.column_iter_mut() {
            col += &self.mean;
        }
        draws
    }
}
