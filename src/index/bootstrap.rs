//! Confidence intervals by coefficient simulation.
//!
//! Both parts' coefficients are drawn `n_boot` times from their posterior
//! normal approximations `N(β̂, Vp)`; each draw pair gives a simulated grid
//! index per year. The same draws are shared by all years of an age, so the
//! yearly intervals are mutually consistent.

use nalgebra::DMatrix;
use rand::Rng;

use crate::domain::{BootstrapSettings, ModelPart, YearStatus};
use crate::error::Result;
use crate::fit::FittedModelPair;
use crate::index::predict::YearPrediction;
use crate::math::{MultivariateNormal, stats};

/// Interval and spread of one (age, year).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapInterval {
    pub lower: f64,
    pub upper: f64,
    /// Standard deviation of `ln(index)` over the kept draws; NaN when unavailable.
    pub log_sd: f64,
}

impl BootstrapInterval {
    fn zero() -> Self {
        Self {
            lower: 0.0,
            upper: 0.0,
            log_sd: f64::NAN,
        }
    }

    fn point(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
            log_sd: f64::NAN,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BootstrapEstimator {
    settings: BootstrapSettings,
}

impl BootstrapEstimator {
    pub fn new(settings: BootstrapSettings) -> Self {
        Self { settings }
    }

    /// One interval per entry of `years`, in order.
    ///
    /// Degenerate years get zero bounds. Without enough draws requested,
    /// estimated years get their point estimate as both bounds.
    pub fn intervals<R: Rng + ?Sized>(
        &self,
        pair: &FittedModelPair,
        years: &[YearPrediction],
        rng: &mut R,
    ) -> Result<Vec<BootstrapInterval>> {
        if !self.settings.enabled() {
            return Ok(years
                .iter()
                .map(|y| match y.status {
                    YearStatus::Estimated => BootstrapInterval::point(y.index),
                    _ => BootstrapInterval::zero(),
                })
                .collect());
        }

        let n_boot = self.settings.n_boot;
        let zero_draws = MultivariateNormal::new(pair.zero.coefficients.clone(), &pair.zero.vcov)
            .map_err(|e| e.into_fitting(pair.age_index, ModelPart::Zero))?
            .sample_columns(n_boot, rng);
        let positive_draws =
            MultivariateNormal::new(pair.positive.coefficients.clone(), &pair.positive.vcov)
                .map_err(|e| e.into_fitting(pair.age_index, ModelPart::Positive))?
                .sample_columns(n_boot, rng);

        let (p_lo, p_hi) = self.settings.probabilities();
        Ok(years
            .iter()
            .map(|year| match &year.grid {
                Some(_) if year.status == YearStatus::Estimated => {
                    let samples = simulate_year(pair, year, &zero_draws, &positive_draws);
                    summarise(pair, year.year, &samples, p_lo, p_hi)
                }
                _ => BootstrapInterval::zero(),
            })
            .collect())
    }
}

fn simulate_year(
    pair: &FittedModelPair,
    year: &YearPrediction,
    zero_draws: &DMatrix<f64>,
    positive_draws: &DMatrix<f64>,
) -> Vec<f64> {
    let Some(grid) = &year.grid else {
        return Vec::new();
    };
    (0..zero_draws.ncols())
        .map(|b| {
            grid.index_for(
                pair,
                &zero_draws.column(b).into_owned(),
                &positive_draws.column(b).into_owned(),
            )
        })
        .collect()
}

fn summarise(pair: &FittedModelPair, year: i32, samples: &[f64], p_lo: f64, p_hi: f64) -> BootstrapInterval {
    let kept: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    let dropped = samples.len() - kept.len();
    if dropped > 0 {
        log::warn!(
            "age {} year {year}: dropped {dropped} of {} bootstrap draws with a non-finite index",
            pair.age_label,
            samples.len()
        );
    }
    if kept.is_empty() {
        return BootstrapInterval::zero();
    }

    let logs: Vec<f64> = kept.iter().filter(|v| **v > 0.0).map(|v| v.ln()).collect();
    BootstrapInterval {
        lower: stats::quantile(&kept, p_lo).unwrap_or(0.0),
        upper: stats::quantile(&kept, p_hi).unwrap_or(0.0),
        log_sd: stats::std_dev(&logs).unwrap_or(f64::NAN),
    }
}
