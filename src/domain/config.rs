//! Run configuration.
//!
//! A run is described by one [`RunConfig`], typically loaded from TOML. The
//! per-age vectors (formulas, basis dimensions) must each have exactly one
//! entry per age class; [`RunConfig::model_specs`] is the single validation
//! point and turns the configuration into one immutable [`ModelSpec`] per age.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{CovariateValue, Family, ModelSpec, PenaltyControl, ZeroLink};
use crate::error::{Result, SurveyIndexError};
use crate::models::Formula;

/// Bootstrap is only run when more than this many draws are requested.
pub const MIN_BOOTSTRAP_DRAWS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Age-class labels; the position is the age index.
    pub ages: Vec<String>,
    pub formula_positive: Vec<String>,
    pub formula_zero: Vec<String>,
    pub k_positive: Vec<usize>,
    pub k_zero: Vec<usize>,

    #[serde(default = "default_family")]
    pub family: Family,
    #[serde(default)]
    pub zero_link: ZeroLink,
    /// Responses `<= cutoff` count as absence.
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,
    /// Smoothing-penalty inflation factor (ignored when `use_bic`).
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default)]
    pub use_bic: bool,

    #[serde(default = "default_n_boot")]
    pub n_boot: usize,
    #[serde(default = "default_ci_level")]
    pub ci_level: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Size of the worker pool fitting age classes in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Years to report. Defaults to the distinct years in the observations.
    #[serde(default)]
    pub years: Option<Vec<i32>>,
    #[serde(default)]
    pub knots_positive: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub knots_zero: BTreeMap<String, Vec<f64>>,
    /// Extra named integers formulas may reference (e.g. `k = kd`).
    #[serde(default)]
    pub bindings: BTreeMap<String, usize>,
    /// Covariates fixed for prediction, overriding the per-year defaults.
    #[serde(default)]
    pub predfix: BTreeMap<String, CovariateValue>,
}

fn default_family() -> Family {
    Family::Gamma
}
fn default_cutoff() -> f64 {
    1.0
}
fn default_gamma() -> f64 {
    1.4
}
fn default_n_boot() -> usize {
    1000
}
fn default_ci_level() -> f64 {
    0.95
}
fn default_seed() -> u64 {
    42
}
fn default_workers() -> usize {
    2
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            ages: Vec::new(),
            formula_positive: Vec::new(),
            formula_zero: Vec::new(),
            k_positive: Vec::new(),
            k_zero: Vec::new(),
            family: default_family(),
            zero_link: ZeroLink::default(),
            cutoff: default_cutoff(),
            gamma: default_gamma(),
            use_bic: false,
            n_boot: default_n_boot(),
            ci_level: default_ci_level(),
            seed: default_seed(),
            workers: default_workers(),
            years: None,
            knots_positive: BTreeMap::new(),
            knots_zero: BTreeMap::new(),
            bindings: BTreeMap::new(),
            predfix: BTreeMap::new(),
        }
    }
}

/// Settings shared by every age's bootstrap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapSettings {
    pub n_boot: usize,
    pub ci_level: f64,
    pub seed: u64,
}

impl BootstrapSettings {
    pub fn enabled(&self) -> bool {
        self.n_boot > MIN_BOOTSTRAP_DRAWS
    }

    /// Lower and upper quantile probabilities.
    pub fn probabilities(&self) -> (f64, f64) {
        let half_alpha = (1.0 - self.ci_level) / 2.0;
        (half_alpha, 1.0 - half_alpha)
    }
}

impl RunConfig {
    pub fn penalty(&self) -> PenaltyControl {
        if self.use_bic {
            PenaltyControl::Bic
        } else {
            PenaltyControl::Fixed(self.gamma)
        }
    }

    pub fn bootstrap(&self) -> BootstrapSettings {
        BootstrapSettings {
            n_boot: self.n_boot,
            ci_level: self.ci_level,
            seed: self.seed,
        }
    }

    /// Validate the configuration and build one [`ModelSpec`] per age class.
    ///
    /// Formulas are parsed here so that syntax errors surface before any
    /// fitting work is dispatched.
    pub fn model_specs(&self) -> Result<Vec<ModelSpec>> {
        let n_ages = self.ages.len();
        if n_ages == 0 {
            return Err(SurveyIndexError::Configuration("no age classes configured".to_string()));
        }

        let lengths = [
            ("formula_positive", self.formula_positive.len()),
            ("formula_zero", self.formula_zero.len()),
            ("k_positive", self.k_positive.len()),
            ("k_zero", self.k_zero.len()),
        ];
        for (name, len) in lengths {
            if len != n_ages {
                return Err(SurveyIndexError::Configuration(format!(
                    "`{name}` has {len} entries but {n_ages} age classes are configured"
                )));
            }
        }

        if !(self.cutoff.is_finite() && self.cutoff >= 0.0) {
            return Err(SurveyIndexError::Configuration(format!(
                "cutoff must be finite and >= 0, got {}",
                self.cutoff
            )));
        }
        if !self.use_bic && !(self.gamma.is_finite() && self.gamma > 0.0) {
            return Err(SurveyIndexError::Configuration(format!(
                "gamma must be finite and > 0, got {}",
                self.gamma
            )));
        }
        if !(self.ci_level > 0.0 && self.ci_level < 1.0) {
            return Err(SurveyIndexError::Configuration(format!(
                "ci_level must lie in (0, 1), got {}",
                self.ci_level
            )));
        }
        if self.workers == 0 {
            return Err(SurveyIndexError::Configuration("workers must be >= 1".to_string()));
        }

        let mut specs = Vec::with_capacity(n_ages);
        for (age_index, label) in self.ages.iter().enumerate() {
            let spec = ModelSpec {
                age_index,
                age_label: label.clone(),
                formula_positive: self.formula_positive[age_index].clone(),
                formula_zero: self.formula_zero[age_index].clone(),
                k_positive: self.k_positive[age_index],
                k_zero: self.k_zero[age_index],
                family: self.family,
                zero_link: self.zero_link,
                cutoff: self.cutoff,
                penalty: self.penalty(),
                knots_positive: self.knots_positive.clone(),
                knots_zero: self.knots_zero.clone(),
                bindings: self.bindings.clone(),
            };

            for part in [crate::domain::ModelPart::Positive, crate::domain::ModelPart::Zero] {
                let bindings = spec.bindings_for(part);
                Formula::parse(spec.part(part).formula, &bindings).map_err(|e| {
                    SurveyIndexError::Configuration(format!(
                        "age {label} ({part} formula): {e}"
                    ))
                })?;
            }

            specs.push(spec);
        }

        Ok(specs)
    }
}
