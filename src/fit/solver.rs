//! Penalised regression fits behind the [`SmoothRegression`] seam.
//!
//! The index pipeline only needs "fit a penalised GLM from a formula and give
//! me coefficients, their covariance and a prediction function". That is the
//! [`SmoothRegression`] trait; [`PenalizedIrls`] is the implementation.
//!
//! P-IRLS outline (one iteration):
//! 1. working weights `w = (dμ/dη)² / V(μ)` and response `z = η − off + (y − μ)/(dμ/dη)`
//! 2. smoothing parameters re-selected on the working model until they settle
//! 3. penalised weighted least squares for `β`
//! 4. step halving while the deviance increases (once `λ` is frozen)
//!
//! Converges when the relative deviance change drops below `tol`.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::domain::Frame;
use crate::error::{Result, SurveyIndexError};
use crate::fit::smoothing::{Criterion, WorkingModel, select_lambdas};
use crate::math::{spd_factor, symmetrize};
use crate::models::{Design, DesignSpec, Distribution, Formula, GlmFamily};

/// Everything needed to fit one penalised GLM.
#[derive(Debug, Clone, Copy)]
pub struct FitRequest<'a> {
    pub formula: &'a Formula,
    pub frame: &'a Frame,
    pub response: &'a [f64],
    pub family: GlmFamily,
    /// Explicit spline breakpoints by covariate name.
    pub knots: &'a BTreeMap<String, Vec<f64>>,
    /// Inflation of the model degrees of freedom in the selection score.
    pub gamma: f64,
}

/// Fitting contract used by the two-part model.
pub trait SmoothRegression: Send + Sync {
    fn fit(&self, request: &FitRequest<'_>) -> Result<FittedSmooth>;
}

/// A converged penalised GLM.
#[derive(Debug, Clone)]
pub struct FittedSmooth {
    pub family: GlmFamily,
    pub design: DesignSpec,
    pub coefficients: DVector<f64>,
    /// Posterior covariance `(XᵀWX + Sλ)⁻¹ φ`.
    pub vcov: DMatrix<f64>,
    pub edf: f64,
    /// Dispersion `φ` (residual variance for the Gaussian family).
    pub scale: f64,
    pub deviance: f64,
    pub log_likelihood: f64,
    pub fitted: Vec<f64>,
    pub lambdas: Vec<f64>,
    pub iterations: usize,
}

impl FittedSmooth {
    pub fn n_obs(&self) -> usize {
        self.fitted.len()
    }

    /// Model matrix and offset of `frame` under the fitted basis.
    pub fn lp_matrix(&self, frame: &Frame) -> Result<Design> {
        self.design.design(frame)
    }

    /// Linear predictor `Xβ + offset` on `frame`.
    pub fn predict_link(&self, frame: &Frame) -> Result<DVector<f64>> {
        let design = self.lp_matrix(frame)?;
        Ok(linear_predictor(&design, &self.coefficients))
    }

    pub fn aic(&self) -> f64 {
        2.0 * self.edf - 2.0 * self.log_likelihood
    }
}

/// `Xβ + offset`.
pub fn linear_predictor(design: &Design, beta: &DVector<f64>) -> DVector<f64> {
    &design.x * beta + &design.offset
}

/// Penalised iteratively re-weighted least squares.
#[derive(Debug, Clone)]
pub struct PenalizedIrls {
    pub max_iter: usize,
    /// Relative deviance change at convergence.
    pub tol: f64,
    /// Smoothing parameters are no longer re-selected after this many iterations.
    pub lambda_freeze_iter: usize,
    pub max_halvings: usize,
}

impl Default for PenalizedIrls {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-7,
            lambda_freeze_iter: 20,
            max_halvings: 25,
        }
    }
}

/// Relative change below which smoothing parameters count as settled.
const LAMBDA_SETTLED: f64 = 1e-3;

/// Floor on working weights.
const MIN_WEIGHT: f64 = 1e-12;

struct State {
    beta: DVector<f64>,
    eta: DVector<f64>,
    mu: DVector<f64>,
    deviance: f64,
}

impl PenalizedIrls {
    fn validate(&self, request: &FitRequest<'_>) -> Result<()> {
        let n = request.frame.n_rows();
        if request.response.len() != n {
            return Err(SurveyIndexError::Configuration(format!(
                "response has {} values but the frame has {n} rows",
                request.response.len()
            )));
        }
        if n == 0 {
            return Err(SurveyIndexError::Numerical("no observations to fit".to_string()));
        }
        if let Some((i, y)) = request
            .response
            .iter()
            .enumerate()
            .find(|(_, y)| !request.family.valid_response(**y))
        {
            return Err(SurveyIndexError::Numerical(format!(
                "response {y} at row {i} is invalid for {}",
                request.family.name()
            )));
        }
        Ok(())
    }

    fn state(
        &self,
        family: GlmFamily,
        design: &Design,
        y: &DVector<f64>,
        beta: DVector<f64>,
    ) -> State {
        let eta = linear_predictor(design, &beta);
        let mu = eta.map(|e| family.clamp_mu(family.link.inverse(e)));
        let deviance = family.deviance(y.as_slice(), mu.as_slice());
        State {
            beta,
            eta,
            mu,
            deviance,
        }
    }
}

/// Working weights and working response (offset removed).
fn working(
    family: GlmFamily,
    y: &DVector<f64>,
    eta: &DVector<f64>,
    mu: &DVector<f64>,
    offset: &DVector<f64>,
) -> (DVector<f64>, DVector<f64>) {
    let n = y.len();
    let mut w = DVector::zeros(n);
    let mut z = DVector::zeros(n);
    for i in 0..n {
        let d = family.link.mu_eta(eta[i]).max(MIN_WEIGHT);
        let v = family.variance(mu[i]).max(MIN_WEIGHT);
        w[i] = (d * d / v).max(MIN_WEIGHT);
        z[i] = eta[i] - offset[i] + (y[i] - mu[i]) / d;
    }
    (w, z)
}

fn lambdas_settled(old: &[f64], new: &[f64]) -> bool {
    old.iter()
        .zip(new)
        .all(|(a, b)| (a - b).abs() <= LAMBDA_SETTLED * a.abs().max(b.abs()))
}

impl SmoothRegression for PenalizedIrls {
    fn fit(&self, request: &FitRequest<'_>) -> Result<FittedSmooth> {
        self.validate(request)?;
        let family = request.family;
        let (spec, design) = DesignSpec::build(request.formula, request.frame, request.knots)?;
        let penalties = spec.penalties();
        let criterion = Criterion::for_family(family);
        let n = request.response.len();
        let y = DVector::from_column_slice(request.response);

        // Initial means straight from the data.
        let mut mu = y.map(|v| family.clamp_mu(family.initial_mu(v)));
        let mut eta = mu.map(|m| family.link.link(m));
        let mut current: Option<State> = None;
        let mut lambdas = vec![1.0; penalties.len()];
        let mut frozen = penalties.is_empty();
        let mut converged = false;
        let mut iterations = 0;

        while iterations < self.max_iter {
            iterations += 1;
            let (w, z) = working(family, &y, &eta, &mu, &design.offset);
            let model = WorkingModel::new(&design.x, &w, &z, penalties);

            let mut lambdas_moved = false;
            if !frozen {
                let selected = select_lambdas(&model, criterion, request.gamma, &lambdas)?;
                lambdas_moved = !lambdas_settled(&lambdas, &selected);
                lambdas = selected;
                if !lambdas_moved || iterations >= self.lambda_freeze_iter {
                    frozen = true;
                }
            }

            let a = model.penalized(&lambdas);
            let beta = spd_factor(&a)
                .map(|chol| chol.solve(&(design.x.transpose() * w.component_mul(&z))))
                .filter(|b| b.iter().all(|v| v.is_finite()))
                .ok_or_else(|| {
                    SurveyIndexError::Numerical(format!(
                        "penalised system is singular at iteration {iterations}"
                    ))
                })?;

            let mut next = self.state(family, &design, &y, beta);
            if let Some(prev) = &current {
                let mut halvings = 0;
                while (!next.deviance.is_finite() || (frozen && next.deviance > prev.deviance))
                    && halvings < self.max_halvings
                {
                    let beta = (&prev.beta + &next.beta) * 0.5;
                    next = self.state(family, &design, &y, beta);
                    halvings += 1;
                }
                if halvings > 0 {
                    log::debug!("iteration {iterations}: {halvings} step halvings");
                }
            }
            if !next.deviance.is_finite() {
                return Err(SurveyIndexError::Numerical(format!(
                    "non-finite deviance at iteration {iterations}"
                )));
            }

            log::debug!(
                "iteration {iterations}: deviance={:.8e} lambdas={lambdas:?}",
                next.deviance
            );

            let change = current
                .as_ref()
                .map(|prev| (next.deviance - prev.deviance).abs() / (next.deviance.abs() + 0.1));
            eta = next.eta.clone();
            mu = next.mu.clone();
            current = Some(next);

            if change.is_some_and(|c| c < self.tol) && !lambdas_moved {
                converged = true;
                break;
            }
        }

        let Some(state) = current else {
            return Err(SurveyIndexError::Numerical("no iterations were run".to_string()));
        };
        if !converged {
            return Err(SurveyIndexError::Numerical(format!(
                "P-IRLS did not converge after {} iterations (deviance {:.6e})",
                self.max_iter, state.deviance
            )));
        }

        // Covariance and degrees of freedom at the converged weights.
        let (w, _) = working(family, &y, &state.eta, &state.mu, &design.offset);
        let model = WorkingModel::new(&design.x, &w, &DVector::zeros(n), penalties);
        let a_inv = spd_factor(&model.penalized(&lambdas))
            .map(|chol| chol.inverse())
            .filter(|m| m.iter().all(|v| v.is_finite()))
            .ok_or_else(|| {
                SurveyIndexError::Numerical("cannot invert the penalised information".to_string())
            })?;
        let edf = (&a_inv * model.xtwx()).trace();
        let residual_df = (n as f64 - edf).max(1.0);
        let scale = match family.distribution {
            Distribution::Binomial => 1.0,
            Distribution::Gaussian => state.deviance / residual_df,
            Distribution::Gamma => {
                let pearson: f64 = y
                    .iter()
                    .zip(state.mu.iter())
                    .map(|(yi, mi)| (yi - mi) * (yi - mi) / family.variance(*mi))
                    .sum();
                pearson / residual_df
            }
        };
        let vcov = symmetrize(&(a_inv * scale));
        let log_likelihood = family.log_likelihood(y.as_slice(), state.mu.as_slice());

        log::debug!(
            "{} converged in {iterations} iterations: edf={edf:.3} scale={scale:.4e} loglik={log_likelihood:.4}",
            family.name()
        );

        Ok(FittedSmooth {
            family,
            design: spec,
            coefficients: state.beta,
            vcov,
            edf,
            scale,
            deviance: state.deviance,
            log_likelihood,
            fitted: state.mu.iter().copied().collect(),
            lambdas,
            iterations,
        })
    }
}
