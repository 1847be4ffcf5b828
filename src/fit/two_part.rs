//! Delta-style two-part model for one age class.
//!
//! - zero part: presence (`count > cutoff`) on all hauls, binomial with the
//!   configured link
//! - positive part: the counts of hauls above the cutoff, either Gamma(log)
//!   on the counts or Gaussian on `ln(count)` (LogNormal)
//!
//! The expected catch of a haul is `P(presence) · E[count | presence]`, where
//! the LogNormal mean carries the `σ²/2` bias correction.

use std::collections::BTreeMap;

use crate::domain::{Family, Frame, ModelPart, ModelSpec};
use crate::error::{Result, SurveyIndexError};
use crate::fit::solver::{FitRequest, FittedSmooth, SmoothRegression};
use crate::models::{Formula, GlmFamily, Link};

/// Both fitted parts of one age class.
#[derive(Debug, Clone)]
pub struct FittedModelPair {
    pub age_index: usize,
    pub age_label: String,
    pub family: Family,
    pub positive: FittedSmooth,
    pub zero: FittedSmooth,
    /// Dispersion of the positive part; the log-scale variance for LogNormal.
    pub sig2: f64,
    /// Log-likelihood of the observed counts under the combined model.
    pub log_likelihood: f64,
    pub edf: f64,
    pub n_hauls: usize,
    pub n_positive: usize,
}

impl FittedModelPair {
    /// Response-scale mean of the positive part from its linear predictor.
    pub fn positive_mean(&self, eta: f64) -> f64 {
        match self.family {
            Family::Gamma => eta.exp(),
            Family::LogNormal => (eta + self.sig2 / 2.0).exp(),
        }
    }

    /// Presence probability from the zero-part linear predictor.
    pub fn presence(&self, eta: f64) -> f64 {
        self.zero.family.link.inverse(eta)
    }

    pub fn aic(&self) -> f64 {
        2.0 * self.edf - 2.0 * self.log_likelihood
    }
}

/// Fits the zero and positive parts of an age class with one regression backend.
#[derive(Debug, Clone, Default)]
pub struct TwoPartModelFitter<R> {
    regression: R,
}

impl<R: SmoothRegression> TwoPartModelFitter<R> {
    pub fn new(regression: R) -> Self {
        Self { regression }
    }

    /// Fit both parts for `spec` on the haul `frame`, where `counts[i]` is
    /// the catch of this age in haul `i`.
    ///
    /// Every failure is reported as a fitting error of this age and part.
    pub fn fit(&self, spec: &ModelSpec, frame: &Frame, counts: &[f64]) -> Result<FittedModelPair> {
        let age = spec.age_index;
        if counts.len() != frame.n_rows() {
            return Err(SurveyIndexError::Configuration(format!(
                "age {}: {} counts for {} hauls",
                spec.age_label,
                counts.len(),
                frame.n_rows()
            ))
            .into_fitting(age, ModelPart::Zero));
        }
        if let Some(bad) = counts.iter().find(|c| !c.is_finite() || **c < 0.0) {
            return Err(SurveyIndexError::Numerical(format!(
                "age {}: invalid count {bad}",
                spec.age_label
            ))
            .into_fitting(age, ModelPart::Zero));
        }

        let presence: Vec<f64> = counts
            .iter()
            .map(|&c| if c > spec.cutoff { 1.0 } else { 0.0 })
            .collect();
        let positive_rows: Vec<usize> = (0..counts.len()).filter(|&i| presence[i] > 0.0).collect();
        if positive_rows.is_empty() {
            return Err(SurveyIndexError::Numerical(format!(
                "no catches above the cutoff {}",
                spec.cutoff
            ))
            .into_fitting(age, ModelPart::Positive));
        }

        log::info!(
            "age {}: fitting {} hauls ({} positive)",
            spec.age_label,
            counts.len(),
            positive_rows.len()
        );

        let positive_frame = frame.subset(&positive_rows);
        let positive_counts: Vec<f64> = positive_rows.iter().map(|&i| counts[i]).collect();
        let (positive_family, positive_response) = match spec.family {
            Family::Gamma => (GlmFamily::gamma(), positive_counts.clone()),
            Family::LogNormal => (
                GlmFamily::gaussian(),
                positive_counts.iter().map(|c| c.ln()).collect(),
            ),
        };

        let positive = self
            .fit_part(spec, ModelPart::Positive, &positive_frame, &positive_response, positive_family)
            .map_err(|e| e.into_fitting(age, ModelPart::Positive))?;
        let zero = self
            .fit_part(
                spec,
                ModelPart::Zero,
                frame,
                &presence,
                GlmFamily::binomial(Link::from(spec.zero_link)),
            )
            .map_err(|e| e.into_fitting(age, ModelPart::Zero))?;

        // Binomial log-likelihood is Σ ln(1 − p) over absences plus Σ ln p
        // over presences; the LogNormal density adds the Jacobian of ln y.
        let jacobian = match spec.family {
            Family::Gamma => 0.0,
            Family::LogNormal => positive_counts.iter().map(|c| c.ln()).sum::<f64>(),
        };
        let log_likelihood = zero.log_likelihood + positive.log_likelihood - jacobian;
        let edf = zero.edf + positive.edf;

        log::info!(
            "age {}: positive edf={:.2}, zero edf={:.2}, loglik={log_likelihood:.3}",
            spec.age_label,
            positive.edf,
            zero.edf
        );

        Ok(FittedModelPair {
            age_index: age,
            age_label: spec.age_label.clone(),
            family: spec.family,
            sig2: positive.scale,
            positive,
            zero,
            log_likelihood,
            edf,
            n_hauls: counts.len(),
            n_positive: positive_rows.len(),
        })
    }

    fn fit_part(
        &self,
        spec: &ModelSpec,
        part: ModelPart,
        frame: &Frame,
        response: &[f64],
        family: GlmFamily,
    ) -> Result<FittedSmooth> {
        let part_spec = spec.part(part);
        let bindings: BTreeMap<String, usize> = spec.bindings_for(part);
        let formula = Formula::parse(part_spec.formula, &bindings)?;
        let gamma = spec.penalty.gamma_for(response.len());
        log::debug!(
            "age {} {part}: {} ~ {} (gamma={gamma:.3})",
            spec.age_label,
            family.name(),
            part_spec.formula
        );
        self.regression.fit(&FitRequest {
            formula: &formula,
            frame,
            response,
            family,
            knots: part_spec.knots,
            gamma,
        })
    }
}
