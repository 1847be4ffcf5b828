//! Smoothing-parameter selection on a working linear model.
//!
//! Each P-IRLS iteration reduces the GLM to a weighted least-squares problem
//! in the working response `z` with weights `w`. For a candidate vector of
//! smoothing parameters `λ` we solve
//!
//! ```text
//! A(λ) = XᵀWX + Σ λ_j S_j,   β = A⁻¹ XᵀWz,   edf = tr(A⁻¹ XᵀWX)
//! ```
//!
//! and score it with
//! - GCV `n·RSS / (n − γ·edf)²` when the scale is unknown (Gamma, Gaussian)
//! - UBRE `RSS/n − 1 + 2γ·edf/n` when it is known (binomial)
//!
//! `λ` is chosen by deterministic coordinate search over a log-spaced grid:
//! one penalty at a time, holding the others fixed, until a sweep changes
//! nothing.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SurveyIndexError};
use crate::math::spd_factor;
use crate::models::{GlmFamily, Penalty};

pub const LAMBDA_MIN: f64 = 1e-6;
pub const LAMBDA_MAX: f64 = 1e6;
pub const LAMBDA_STEPS: usize = 37;

/// Upper bound on coordinate sweeps per selection.
const MAX_SWEEPS: usize = 5;

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > min) {
        return Err(SurveyIndexError::Configuration(format!(
            "invalid smoothing-parameter range: min={min}, max={max}"
        )));
    }
    if steps < 2 {
        return Err(SurveyIndexError::Configuration(
            "smoothing-parameter grid needs at least 2 steps".to_string(),
        ));
    }

    let ln_min = min.ln();
    let step = (max.ln() - ln_min) / (steps as f64 - 1.0);
    Ok((0..steps).map(|i| (ln_min + step * i as f64).exp()).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    Gcv,
    Ubre,
}

impl Criterion {
    pub fn for_family(family: GlmFamily) -> Self {
        if family.known_scale() {
            Criterion::Ubre
        } else {
            Criterion::Gcv
        }
    }

    pub fn score(self, rss: f64, edf: f64, n: usize, gamma: f64) -> f64 {
        let n = n as f64;
        match self {
            Criterion::Gcv => {
                let denom = n - gamma * edf;
                if denom <= 0.0 {
                    f64::INFINITY
                } else {
                    n * rss / (denom * denom)
                }
            }
            Criterion::Ubre => rss / n - 1.0 + 2.0 * gamma * edf / n,
        }
    }
}

/// Penalised solution of the working model at one `λ`.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub beta: DVector<f64>,
    pub edf: f64,
    pub rss: f64,
    pub score: f64,
}

/// Sufficient statistics of one weighted least-squares problem.
#[derive(Debug, Clone)]
pub struct WorkingModel<'a> {
    xtwx: DMatrix<f64>,
    xtwz: DVector<f64>,
    ztwz: f64,
    n: usize,
    penalties: &'a [Penalty],
}

impl<'a> WorkingModel<'a> {
    pub fn new(
        x: &DMatrix<f64>,
        w: &DVector<f64>,
        z: &DVector<f64>,
        penalties: &'a [Penalty],
    ) -> Self {
        let mut xw = x.clone();
        for mut col in xw.column_iter_mut() {
            col.component_mul_assign(w);
        }
        let xtwx = x.transpose() * &xw;
        let xtwz = xw.transpose() * z;
        let ztwz = z.iter().zip(w.iter()).map(|(zi, wi)| zi * zi * wi).sum();
        Self {
            xtwx,
            xtwz,
            ztwz,
            n: x.nrows(),
            penalties,
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn xtwx(&self) -> &DMatrix<f64> {
        &self.xtwx
    }

    /// `XᵀWX + Σ λ_j S_j`.
    pub fn penalized(&self, lambdas: &[f64]) -> DMatrix<f64> {
        let mut a = self.xtwx.clone();
        add_penalties(&mut a, self.penalties, lambdas);
        a
    }

    pub fn evaluate(&self, lambdas: &[f64], criterion: Criterion, gamma: f64) -> Option<Evaluation> {
        let chol = spd_factor(&self.penalized(lambdas))?;
        let beta = chol.solve(&self.xtwz);
        let edf = chol.solve(&self.xtwx).trace();
        // ‖z − Xβ‖²_W expanded on the sufficient statistics.
        let rss = (self.ztwz - 2.0 * beta.dot(&self.xtwz) + beta.dot(&(&self.xtwx * &beta))).max(0.0);
        if !(edf.is_finite() && rss.is_finite()) || beta.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Evaluation {
            score: criterion.score(rss, edf, self.n, gamma),
            beta,
            edf,
            rss,
        })
    }
}

/// Add `Σ λ_j S_j` into the matching diagonal blocks of `a`.
pub fn add_penalties(a: &mut DMatrix<f64>, penalties: &[Penalty], lambdas: &[f64]) {
    for (penalty, &lambda) in penalties.iter().zip(lambdas) {
        let d = penalty.dim();
        let mut block = a.view_mut((penalty.start, penalty.start), (d, d));
        block += &penalty.matrix * lambda;
    }
}

/// Choose `λ` for the working model, starting the search from `start`.
pub fn select_lambdas(
    model: &WorkingModel<'_>,
    criterion: Criterion,
    gamma: f64,
    start: &[f64],
) -> Result<Vec<f64>> {
    if start.is_empty() {
        return Ok(Vec::new());
    }
    let grid = log_space(LAMBDA_MIN, LAMBDA_MAX, LAMBDA_STEPS)?;

    let mut lambdas = start.to_vec();
    let mut best = model
        .evaluate(&lambdas, criterion, gamma)
        .map_or(f64::INFINITY, |e| e.score);

    for sweep in 0..MAX_SWEEPS {
        let mut changed = false;
        for j in 0..lambdas.len() {
            let mut trial = lambdas.clone();
            for &candidate in &grid {
                trial[j] = candidate;
                let Some(eval) = model.evaluate(&trial, criterion, gamma) else {
                    continue;
                };
                if eval.score < best {
                    best = eval.score;
                    lambdas[j] = candidate;
                    changed = true;
                }
            }
        }
        log::trace!("lambda sweep {sweep}: score={best:.6e} lambdas={lambdas:?}");
        if !changed {
            break;
        }
    }

    if !best.is_finite() {
        return Err(SurveyIndexError::Numerical(
            "no smoothing parameters give a finite selection score".to_string(),
        ));
    }
    Ok(lambdas)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_space_endpoints() {
        let g = log_space(1e-2, 1e2, 5).unwrap();
        assert_eq!(g.len(), 5);
        assert!((g[0] - 1e-2).abs() < 1e-15);
        assert!((g[2] - 1.0).abs() < 1e-12);
        assert!((g[4] - 1e2).abs() < 1e-9);
        assert!(log_space(0.0, 1.0, 5).is_err());
        assert!(log_space(1.0, 2.0, 1).is_err());
    }

    #[test]
    fn scores() {
        assert!((Criterion::Gcv.score(10.0, 2.0, 12, 1.0) - 12.0 * 10.0 / 100.0).abs() < 1e-12);
        assert_eq!(Criterion::Gcv.score(10.0, 12.0, 12, 1.0), f64::INFINITY);
        assert!((Criterion::Ubre.score(12.0, 3.0, 12, 1.0) - 0.5).abs() < 1e-12);
        assert_eq!(Criterion::for_family(GlmFamily::gamma()), Criterion::Gcv);
    }

    /// Second-difference penalty over all columns of an identity design.
    fn ridge_problem(y: &[f64]) -> (DMatrix<f64>, Vec<Penalty>) {
        let n = y.len();
        let x = DMatrix::<f64>::identity(n, n);
        let s = crate::math::difference_penalty(n, 2).unwrap();
        (
            x,
            vec![Penalty {
                label: "s(x)".to_string(),
                start: 0,
                matrix: s,
            }],
        )
    }

    #[test]
    fn linear_data_is_smoothed_heavily() {
        let y: Vec<f64> = (0..30)
            .map(|i| 0.5 * i as f64 + if i % 2 == 0 { 0.3 } else { -0.3 })
            .collect();
        let (x, penalties) = ridge_problem(&y);
        let w = DVector::from_element(y.len(), 1.0);
        let z = DVector::from_vec(y);
        let model = WorkingModel::new(&x, &w, &z, &penalties);
        let lambdas = select_lambdas(&model, Criterion::Gcv, 1.0, &[1.0]).unwrap();
        assert!(lambdas[0] > 10.0, "lambda = {}", lambdas[0]);

        let eval = model.evaluate(&lambdas, Criterion::Gcv, 1.0).unwrap();
        assert!(eval.edf < 5.0);
    }

    #[test]
    fn wiggly_signal_keeps_flexibility() {
        let y: Vec<f64> = (0..40).map(|i| (i as f64 * 0.5).sin() * 3.0).collect();
        let (x, penalties) = ridge_problem(&y);
        let w = DVector::from_element(y.len(), 1.0);
        let z = DVector::from_vec(y);
        let model = WorkingModel::new(&x, &w, &z, &penalties);
        let lambdas = select_lambdas(&model, Criterion::Gcv, 1.0, &[1.0]).unwrap();
        let eval = model.evaluate(&lambdas, Criterion::Gcv, 1.0).unwrap();
        assert!(eval.edf > 5.0, "edf = {}", eval.edf);
    }
}
