//! Shared domain types.
//!
//! These types are intentionally kept lightweight so they can be:
//!
//! - produced by external collaborators (numbers-at-age estimation, grid construction)
//! - read concurrently by every per-age worker without copying
//! - deserialized from run configuration files

use std::collections::BTreeMap;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// One haul with its numbers-at-age already computed.
///
/// `numbers_at_age[a]` is the response for age class `a`.
#[derive(Debug, Clone, PartialEq)]
pub struct HaulRecord {
    pub haul_id: String,
    pub year: i32,
    pub lon: f64,
    pub lat: f64,
    pub depth: f64,
    pub gear: String,
    pub ship: String,
    /// Day of year (or any fractional time-of-year measure).
    pub time_of_year: f64,
    /// Haul duration in minutes.
    pub haul_dur: f64,
    /// Additional numeric covariates referenced by formulas.
    pub extra: BTreeMap<String, f64>,
    pub numbers_at_age: Vec<f64>,
}

/// One cell of the prediction grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub lon: f64,
    pub lat: f64,
    pub depth: f64,
    /// Additional numeric covariates that vary over space.
    pub extra: BTreeMap<String, f64>,
}

/// Distribution of the positive part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Gamma with log link.
    Gamma,
    /// Gaussian on `ln(y)`; back-transformed with the log-normal mean correction.
    #[serde(rename = "lognormal")]
    #[value(name = "lognormal")]
    LogNormal,
}

impl Family {
    pub fn display_name(self) -> &'static str {
        match self {
            Family::Gamma => "Gamma",
            Family::LogNormal => "LogNormal",
        }
    }
}

/// Link function of the presence/absence part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ZeroLink {
    #[default]
    Logit,
    Cloglog,
}

/// Which half of the two-part model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelPart {
    Positive,
    Zero,
}

impl fmt::Display for ModelPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelPart::Positive => write!(f, "positive"),
            ModelPart::Zero => write!(f, "zero"),
        }
    }
}

/// How the smoothing-penalty inflation factor is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PenaltyControl {
    /// Use this inflation factor for both parts.
    Fixed(f64),
    /// Use `ln(n)/2`, with `n` counted separately for each part.
    Bic,
}

impl PenaltyControl {
    /// Inflation factor for a part fitted on `n` rows.
    pub fn gamma_for(self, n: usize) -> f64 {
        match self {
            PenaltyControl::Fixed(gamma) => gamma,
            PenaltyControl::Bic => (n.max(1) as f64).ln() / 2.0,
        }
    }
}

/// A covariate value fixed for prediction (year label, gear, haul duration...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateValue {
    Numeric(f64),
    Level(String),
}

/// Per-age immutable model configuration.
///
/// Everything a formula may reference is carried here explicitly: the basis
/// dimension for each part is bound to the name `k`, and `bindings` adds any
/// other named integers.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub age_index: usize,
    pub age_label: String,
    pub formula_positive: String,
    pub formula_zero: String,
    pub k_positive: usize,
    pub k_zero: usize,
    pub family: Family,
    pub zero_link: ZeroLink,
    pub cutoff: f64,
    pub penalty: PenaltyControl,
    pub knots_positive: BTreeMap<String, Vec<f64>>,
    pub knots_zero: BTreeMap<String, Vec<f64>>,
    pub bindings: BTreeMap<String, usize>,
}

/// The formula, basis dimension and knots of one model part.
#[derive(Debug, Clone, Copy)]
pub struct PartSpec<'a> {
    pub part: ModelPart,
    pub formula: &'a str,
    pub k: usize,
    pub knots: &'a BTreeMap<String, Vec<f64>>,
}

impl ModelSpec {
    pub fn part(&self, part: ModelPart) -> PartSpec<'_> {
        match part {
            ModelPart::Positive => PartSpec {
                part,
                formula: &self.formula_positive,
                k: self.k_positive,
                knots: &self.knots_positive,
            },
            ModelPart::Zero => PartSpec {
                part,
                formula: &self.formula_zero,
                k: self.k_zero,
                knots: &self.knots_zero,
            },
        }
    }

    /// Integer bindings visible to a part's formula (`k` plus user bindings).
    pub fn bindings_for(&self, part: ModelPart) -> BTreeMap<String, usize> {
        let mut out = self.bindings.clone();
        out.insert("k".to_string(), self.part(part).k);
        out
    }
}

/// Why a (age, year) cell holds the value it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearStatus {
    /// Predicted normally.
    Estimated,
    /// No observation in the year exceeded the cutoff; index and bounds are zero.
    NoPositiveCatch,
    /// Grid prediction failed; index and bounds are zero.
    PredictionFailed,
}

impl YearStatus {
    pub fn is_degenerate(self) -> bool {
        !matches!(self, YearStatus::Estimated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bic_penalty_uses_half_log_n() {
        let g = PenaltyControl::Bic.gamma_for(100);
        assert!((g - (100.0f64).ln() / 2.0).abs() < 1e-12);
        assert_eq!(PenaltyControl::Fixed(1.4).gamma_for(100), 1.4);
    }

    #[test]
    fn bindings_expose_part_basis_dimension_as_k() {
        let spec = ModelSpec {
            age_index: 0,
            age_label: "1".to_string(),
            formula_positive: "s(lon, lat, k = k)".to_string(),
            formula_zero: "s(lon, lat, k = k)".to_string(),
            k_positive: 40,
            k_zero: 25,
            family: Family::Gamma,
            zero_link: ZeroLink::Logit,
            cutoff: 1.0,
            penalty: PenaltyControl::Fixed(1.4),
            knots_positive: BTreeMap::new(),
            knots_zero: BTreeMap::new(),
            bindings: BTreeMap::from([("kd".to_string(), 6)]),
        };
        assert_eq!(spec.bindings_for(ModelPart::Positive)["k"], 40);
        assert_eq!(spec.bindings_for(ModelPart::Zero)["k"], 25);
        assert_eq!(spec.bindings_for(ModelPart::Zero)["kd"], 6);
    }
}
