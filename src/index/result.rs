//! The assembled abundance index.

use nalgebra::DMatrix;

use crate::domain::YearStatus;
use crate::fit::FittedModelPair;

/// Index of every (year, age): rows are years, columns are age classes.
#[derive(Debug, Clone)]
pub struct IndexResult {
    pub years: Vec<i32>,
    pub ages: Vec<String>,
    pub index: DMatrix<f64>,
    pub lower: DMatrix<f64>,
    pub upper: DMatrix<f64>,
    /// Bootstrap standard deviation of `ln(index)`; NaN where no draws exist.
    pub log_sd: DMatrix<f64>,
    pub status: DMatrix<YearStatus>,
    /// Fitted models, one per age, in age order.
    pub models: Vec<FittedModelPair>,
    /// Expected catch per grid cell, indexed `[age][year][cell]`.
    pub cell_predictions: Vec<Vec<Vec<f64>>>,
    /// Response each age was fitted to, one count per haul in input order.
    pub age_counts: Vec<Vec<f64>>,
    pub age_log_likelihood: Vec<f64>,
    pub age_edf: Vec<f64>,
    pub total_log_likelihood: f64,
    pub total_edf: f64,
}

impl IndexResult {
    pub fn n_years(&self) -> usize {
        self.years.len()
    }

    pub fn n_ages(&self) -> usize {
        self.ages.len()
    }

    pub fn year_row(&self, year: i32) -> Option<usize> {
        self.years.iter().position(|&y| y == year)
    }

    /// `2·edf − 2·logLik` over all models.
    pub fn aic(&self) -> f64 {
        2.0 * self.total_edf - 2.0 * self.total_log_likelihood
    }

    /// Number of (year, age) entries that were set to zero.
    pub fn degenerate_count(&self) -> usize {
        self.status.iter().filter(|s| s.is_degenerate()).count()
    }
}
