//! Column-oriented covariate tables.
//!
//! Formulas refer to covariates by name. A [`Frame`] is the single lookup
//! structure the design-matrix builder reads from, for both the haul
//! observations (fitting) and the prediction grid (prediction with per-year
//! fixed covariates).

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{CovariateValue, GridCell, HaulRecord};
use crate::error::{Result, SurveyIndexError};

/// Standard covariate names.
pub const YEAR: &str = "year";
pub const CTIME: &str = "ctime";
pub const LON: &str = "lon";
pub const LAT: &str = "lat";
pub const DEPTH: &str = "depth";
pub const GEAR: &str = "gear";
pub const SHIP: &str = "ship";
pub const TIME_OF_YEAR: &str = "time_of_year";
pub const HAUL_DUR: &str = "haul_dur";
/// 1 for observations, 0 in prediction: switches off `by = dum` terms.
pub const DUM: &str = "dum";

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    Factor(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Factor(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, rows: &[usize]) -> Column {
        match self {
            Column::Numeric(v) => Column::Numeric(rows.iter().map(|&i| v[i]).collect()),
            Column::Factor(v) => Column::Factor(rows.iter().map(|&i| v[i].clone()).collect()),
        }
    }

    fn broadcast(value: &CovariateValue, n: usize) -> Column {
        match value {
            CovariateValue::Numeric(x) => Column::Numeric(vec![*x; n]),
            CovariateValue::Level(s) => Column::Factor(vec![s.clone(); n]),
        }
    }
}

/// Named, equal-length covariate columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    n_rows: usize,
    columns: BTreeMap<String, Column>,
}

impl Frame {
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_rows,
            columns: BTreeMap::new(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Insert or replace a column.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<()> {
        let name = name.into();
        if column.len() != self.n_rows {
            return Err(SurveyIndexError::Configuration(format!(
                "column `{name}` has {} rows, frame has {}",
                column.len(),
                self.n_rows
            )));
        }
        self.columns.insert(name, column);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        match self.columns.get(name) {
            Some(Column::Numeric(v)) => Ok(v),
            Some(Column::Factor(_)) => Err(SurveyIndexError::Formula(format!(
                "covariate `{name}` is a factor where a numeric covariate is required"
            ))),
            None => Err(SurveyIndexError::Formula(format!("covariate `{name}` is missing"))),
        }
    }

    pub fn factor(&self, name: &str) -> Result<&[String]> {
        match self.columns.get(name) {
            Some(Column::Factor(v)) => Ok(v),
            Some(Column::Numeric(_)) => Err(SurveyIndexError::Formula(format!(
                "covariate `{name}` is numeric where a factor is required"
            ))),
            None => Err(SurveyIndexError::Formula(format!("covariate `{name}` is missing"))),
        }
    }

    /// Rows `rows` of this frame, in the given order.
    pub fn subset(&self, rows: &[usize]) -> Frame {
        Frame {
            n_rows: rows.len(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.select(rows)))
                .collect(),
        }
    }

    /// Observation frame with the standard haul covariates.
    ///
    /// Extra covariates missing from some hauls are filled with NaN; the design
    /// builder rejects them only if a formula actually uses them.
    pub fn from_hauls(hauls: &[HaulRecord]) -> Result<Frame> {
        let n = hauls.len();
        let mut frame = Frame::new(n);

        frame.insert(YEAR, Column::Factor(hauls.iter().map(|h| h.year.to_string()).collect()))?;
        frame.insert(CTIME, Column::Numeric(hauls.iter().map(|h| h.year as f64).collect()))?;
        frame.insert(LON, Column::Numeric(hauls.iter().map(|h| h.lon).collect()))?;
        frame.insert(LAT, Column::Numeric(hauls.iter().map(|h| h.lat).collect()))?;
        frame.insert(DEPTH, Column::Numeric(hauls.iter().map(|h| h.depth).collect()))?;
        frame.insert(GEAR, Column::Factor(hauls.iter().map(|h| h.gear.clone()).collect()))?;
        frame.insert(SHIP, Column::Factor(hauls.iter().map(|h| h.ship.clone()).collect()))?;
        frame.insert(TIME_OF_YEAR, Column::Numeric(hauls.iter().map(|h| h.time_of_year).collect()))?;
        frame.insert(HAUL_DUR, Column::Numeric(hauls.iter().map(|h| h.haul_dur).collect()))?;
        frame.insert(DUM, Column::Numeric(vec![1.0; n]))?;

        let extra_names: BTreeSet<&String> = hauls.iter().flat_map(|h| h.extra.keys()).collect();
        for name in extra_names {
            let values = hauls
                .iter()
                .map(|h| h.extra.get(name).copied().unwrap_or(f64::NAN))
                .collect();
            frame.insert(name.clone(), Column::Numeric(values))?;
        }

        Ok(frame)
    }

    /// Prediction frame: spatial covariates from the grid, everything in
    /// `fixed` broadcast to every cell (overriding grid columns of the same name).
    pub fn for_grid(grid: &[GridCell], fixed: &BTreeMap<String, CovariateValue>) -> Result<Frame> {
        let n = grid.len();
        let mut frame = Frame::new(n);

        frame.insert(LON, Column::Numeric(grid.iter().map(|c| c.lon).collect()))?;
        frame.insert(LAT, Column::Numeric(grid.iter().map(|c| c.lat).collect()))?;
        frame.insert(DEPTH, Column::Numeric(grid.iter().map(|c| c.depth).collect()))?;

        let extra_names: BTreeSet<&String> = grid.iter().flat_map(|c| c.extra.keys()).collect();
        for name in extra_names {
            let values = grid
                .iter()
                .map(|c| c.extra.get(name).copied().unwrap_or(f64::NAN))
                .collect();
            frame.insert(name.clone(), Column::Numeric(values))?;
        }

        for (name, value) in fixed {
            frame.insert(name.clone(), Column::broadcast(value, n))?;
        }

        Ok(frame)
    }
}
