//! Grid prediction of the expected catch per year.
//!
//! For a year `y` every grid cell gets the covariates of a standardised haul:
//! the cell's position and depth, `year = y`, `ctime = y`, `dum = 0`, the
//! nuisance defaults of the age class and finally the user's fixed values.
//! The index is the sum over cells of `P(presence) · E[count | presence]`.
//!
//! A year whose grid cannot be predicted is degraded to zero, never an error.

use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::domain::{CovariateValue, Frame, GridCell, YearStatus, frame};
use crate::error::{Result, SurveyIndexError};
use crate::fit::{FittedModelPair, linear_predictor};
use crate::math::stats;
use crate::models::Design;

/// Grid design matrices of both parts for one year.
#[derive(Debug, Clone)]
pub struct YearGrid {
    pub zero: Design,
    pub positive: Design,
}

impl YearGrid {
    /// Index for one pair of coefficient vectors.
    pub fn index_for(
        &self,
        pair: &FittedModelPair,
        beta_zero: &DVector<f64>,
        beta_positive: &DVector<f64>,
    ) -> f64 {
        self.cells_for(pair, beta_zero, beta_positive).iter().sum()
    }

    /// Per-cell expected catch for one pair of coefficient vectors.
    pub fn cells_for(
        &self,
        pair: &FittedModelPair,
        beta_zero: &DVector<f64>,
        beta_positive: &DVector<f64>,
    ) -> Vec<f64> {
        let eta_zero = linear_predictor(&self.zero, beta_zero);
        let eta_positive = linear_predictor(&self.positive, beta_positive);
        eta_zero
            .iter()
            .zip(eta_positive.iter())
            .map(|(&e0, &e1)| pair.presence(e0) * pair.positive_mean(e1))
            .collect()
    }
}

/// Point prediction for one (age, year).
#[derive(Debug, Clone)]
pub struct YearPrediction {
    pub year: i32,
    pub status: YearStatus,
    pub index: f64,
    /// Expected catch per grid cell (all zero for degenerate years).
    pub cells: Vec<f64>,
    /// Present only for estimated years.
    pub grid: Option<YearGrid>,
}

impl YearPrediction {
    fn degenerate(year: i32, status: YearStatus, n_cells: usize) -> Self {
        Self {
            year,
            status,
            index: 0.0,
            cells: vec![0.0; n_cells],
            grid: None,
        }
    }
}

/// Prediction covariates used for every year unless overridden: the mean of
/// each numeric haul covariate and the most frequent level of each factor.
///
/// Spatial covariates, the year variables, `dum` and anything the grid
/// itself carries are left to the grid and the per-year values.
pub fn prediction_defaults(hauls: &Frame, grid: &[GridCell]) -> BTreeMap<String, CovariateValue> {
    let mut skip: Vec<&str> = vec![
        frame::YEAR,
        frame::CTIME,
        frame::LON,
        frame::LAT,
        frame::DEPTH,
        frame::DUM,
    ];
    skip.extend(grid.iter().flat_map(|c| c.extra.keys().map(String::as_str)));

    let mut defaults = BTreeMap::new();
    for name in hauls.names().filter(|n| !skip.contains(n)) {
        let value = match hauls.column(name) {
            Some(frame::Column::Numeric(v)) => stats::mean(v).map(CovariateValue::Numeric),
            Some(frame::Column::Factor(v)) => stats::mode(v).map(CovariateValue::Level),
            None => None,
        };
        if let Some(value) = value {
            defaults.insert(name.to_string(), value);
        }
    }
    defaults
}

/// Predicts the grid total of one fitted age class.
#[derive(Debug, Clone)]
pub struct GridPredictor<'a> {
    pair: &'a FittedModelPair,
    grid: &'a [GridCell],
    defaults: &'a BTreeMap<String, CovariateValue>,
    predfix: &'a BTreeMap<String, CovariateValue>,
}

impl<'a> GridPredictor<'a> {
    pub fn new(
        pair: &'a FittedModelPair,
        grid: &'a [GridCell],
        defaults: &'a BTreeMap<String, CovariateValue>,
        predfix: &'a BTreeMap<String, CovariateValue>,
    ) -> Self {
        Self {
            pair,
            grid,
            defaults,
            predfix,
        }
    }

    /// Covariate frame of the grid for `year`.
    pub fn prediction_frame(&self, year: i32) -> Result<Frame> {
        let mut fixed = self.defaults.clone();
        fixed.insert(frame::YEAR.to_string(), CovariateValue::Level(year.to_string()));
        fixed.insert(frame::CTIME.to_string(), CovariateValue::Numeric(year as f64));
        fixed.insert(frame::DUM.to_string(), CovariateValue::Numeric(0.0));
        fixed.extend(self.predfix.iter().map(|(k, v)| (k.clone(), v.clone())));
        Frame::for_grid(self.grid, &fixed)
    }

    fn year_grid(&self, year: i32) -> Result<YearGrid> {
        let frame = self.prediction_frame(year)?;
        Ok(YearGrid {
            zero: self.pair.zero.lp_matrix(&frame)?,
            positive: self.pair.positive.lp_matrix(&frame)?,
        })
    }

    /// Point estimate for `year`. `has_positive` tells whether any haul of
    /// this age in that year caught more than the cutoff.
    pub fn predict_year(&self, year: i32, has_positive: bool) -> YearPrediction {
        let n_cells = self.grid.len();
        if !has_positive {
            log::warn!(
                "age {} year {year}: no catch above the cutoff, index set to 0",
                self.pair.age_label
            );
            return YearPrediction::degenerate(year, YearStatus::NoPositiveCatch, n_cells);
        }

        let (beta_zero, beta_positive) = (&self.pair.zero.coefficients, &self.pair.positive.coefficients);
        let attempt = self.year_grid(year).and_then(|grid| {
            let eta_zero = linear_predictor(&grid.zero, beta_zero);
            let eta_positive = linear_predictor(&grid.positive, beta_positive);
            if eta_zero.iter().chain(eta_positive.iter()).any(|v| !v.is_finite()) {
                return Err(SurveyIndexError::Numerical(
                    "non-finite linear predictor on the grid".to_string(),
                ));
            }
            let cells = grid.cells_for(self.pair, beta_zero, beta_positive);
            match cells.iter().position(|c| !c.is_finite()) {
                Some(i) => Err(SurveyIndexError::Numerical(format!(
                    "non-finite prediction in grid cell {i}"
                ))),
                None => Ok((grid, cells)),
            }
        });

        match attempt {
            Ok((grid, cells)) => YearPrediction {
                year,
                status: YearStatus::Estimated,
                index: cells.iter().sum(),
                cells,
                grid: Some(grid),
            },
            Err(err) => {
                log::warn!(
                    "age {} year {year}: prediction failed ({err}), index set to 0",
                    self.pair.age_label
                );
                YearPrediction::degenerate(year, YearStatus::PredictionFailed, n_cells)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Family, HaulRecord, ModelSpec, PenaltyControl, ZeroLink};
    use crate::fit::{PenalizedIrls, TwoPartModelFitter};

    fn haul(year: i32, gear: &str, haul_dur: f64) -> HaulRecord {
        HaulRecord {
            haul_id: format!("{year}-{gear}"),
            year,
            lon: 5.0,
            lat: 55.0,
            depth: 50.0,
            gear: gear.to_string(),
            ship: "SOL".to_string(),
            time_of_year: 40.0,
            haul_dur,
            extra: BTreeMap::from([("temp".to_string(), 8.0), ("swept".to_string(), 2.0)]),
            numbers_at_age: vec![1.0],
        }
    }

    #[test]
    fn defaults_use_mean_and_mode_of_nuisance_covariates() {
        let hauls = vec![haul(2001, "GOV", 30.0), haul(2002, "GOV", 20.0), haul(2002, "TVL", f64::NAN)];
        let frame = Frame::from_hauls(&hauls).unwrap();
        let grid = vec![GridCell {
            lon: 1.0,
            lat: 54.0,
            depth: 30.0,
            extra: BTreeMap::from([("temp".to_string(), 7.5)]),
        }];

        let defaults = prediction_defaults(&frame, &grid);

        assert_eq!(defaults.get("haul_dur"), Some(&CovariateValue::Numeric(25.0)));
        assert_eq!(defaults.get("gear"), Some(&CovariateValue::Level("GOV".to_string())));
        assert_eq!(defaults.get("swept"), Some(&CovariateValue::Numeric(2.0)));
        for skipped in ["year", "ctime", "lon", "lat", "depth", "dum", "temp"] {
            assert!(!defaults.contains_key(skipped), "{skipped} should not get a default");
        }
    }

    fn fitted_pair(formula_positive: &str) -> (Frame, FittedModelPair) {
        let hauls: Vec<HaulRecord> = (0..60)
            .map(|i| {
                let mut h = haul(2001 + (i % 2) as i32, ["GOV", "TVL"][i % 2], 25.0 + (i % 7) as f64);
                h.depth = 20.0 + 1.5 * i as f64;
                h.numbers_at_age = vec![if i % 3 == 0 {
                    0.0
                } else {
                    (1.0 + h.depth / 100.0).exp() * (1.0 + 0.1 * (i % 5) as f64)
                }];
                h
            })
            .collect();
        let frame = Frame::from_hauls(&hauls).unwrap();
        let counts: Vec<f64> = hauls.iter().map(|h| h.numbers_at_age[0]).collect();
        let spec = ModelSpec {
            age_index: 0,
            age_label: "1".to_string(),
            formula_positive: formula_positive.to_string(),
            formula_zero: "depth".to_string(),
            k_positive: 5,
            k_zero: 5,
            family: Family::Gamma,
            zero_link: ZeroLink::Logit,
            cutoff: 0.0,
            penalty: PenaltyControl::Fixed(1.0),
            knots_positive: BTreeMap::new(),
            knots_zero: BTreeMap::new(),
            bindings: BTreeMap::new(),
        };
        let pair = TwoPartModelFitter::new(PenalizedIrls::default())
            .fit(&spec, &frame, &counts)
            .unwrap();
        (frame, pair)
    }

    fn cells(depths: &[f64]) -> Vec<GridCell> {
        depths
            .iter()
            .map(|&depth| GridCell {
                lon: 2.0,
                lat: 55.0,
                depth,
                extra: BTreeMap::new(),
            })
            .collect()
    }

    fn assert_failed(prediction: &YearPrediction, n_cells: usize) {
        assert_eq!(prediction.status, YearStatus::PredictionFailed);
        assert_eq!(prediction.index, 0.0);
        assert_eq!(prediction.cells, vec![0.0; n_cells]);
        assert!(prediction.grid.is_none());
    }

    #[test]
    fn finite_grid_is_estimated() {
        let (frame, pair) = fitted_pair("depth");
        let grid = cells(&[30.0, 60.0, 90.0]);
        let defaults = prediction_defaults(&frame, &grid);
        let predfix = BTreeMap::new();
        let prediction = GridPredictor::new(&pair, &grid, &defaults, &predfix).predict_year(2001, true);

        assert_eq!(prediction.status, YearStatus::Estimated);
        assert!(prediction.index > 0.0);
        assert_eq!(prediction.index, prediction.cells.iter().sum::<f64>());
    }

    #[test]
    fn overflowing_cell_prediction_fails_the_year() {
        let (frame, mut pair) = fitted_pair("depth");
        pair.positive.coefficients.fill(1.0e3);
        let grid = cells(&[30.0, 60.0]);
        let defaults = prediction_defaults(&frame, &grid);
        let predfix = BTreeMap::new();
        let prediction = GridPredictor::new(&pair, &grid, &defaults, &predfix).predict_year(2001, true);

        assert_failed(&prediction, 2);
    }

    #[test]
    fn non_finite_linear_predictor_fails_the_year() {
        let (frame, mut pair) = fitted_pair("depth");
        pair.zero.coefficients[0] = f64::NAN;
        let grid = cells(&[30.0, 60.0]);
        let defaults = prediction_defaults(&frame, &grid);
        let predfix = BTreeMap::new();
        let prediction = GridPredictor::new(&pair, &grid, &defaults, &predfix).predict_year(2002, true);

        assert_failed(&prediction, 2);
    }

    #[test]
    fn nan_grid_covariate_fails_the_year() {
        let (frame, pair) = fitted_pair("depth");
        let grid = cells(&[30.0, f64::NAN, 90.0]);
        let defaults = prediction_defaults(&frame, &grid);
        let predfix = BTreeMap::new();
        let prediction = GridPredictor::new(&pair, &grid, &defaults, &predfix).predict_year(2001, true);

        assert_failed(&prediction, 3);
    }

    #[test]
    fn missing_grid_covariate_fails_the_year() {
        let (_, pair) = fitted_pair("depth + haul_dur");
        let grid = cells(&[30.0, 60.0]);
        // Without the haul defaults nothing supplies `haul_dur` on the grid.
        let defaults = BTreeMap::new();
        let predfix = BTreeMap::new();
        let prediction = GridPredictor::new(&pair, &grid, &defaults, &predfix).predict_year(2001, true);

        assert_failed(&prediction, 2);
    }
}
