//! Abundance index computation.
//!
//! - `predict`: grid prediction of one fitted age class per year
//! - `bootstrap`: coefficient-simulation confidence intervals
//! - `orchestrator`: parallel per-age driver assembling an [`IndexResult`]

pub mod bootstrap;
pub mod orchestrator;
pub mod predict;
pub mod result;

pub use bootstrap::{BootstrapEstimator, BootstrapInterval};
pub use orchestrator::{run_survey_index, run_survey_index_with};
pub use predict::{GridPredictor, YearGrid, YearPrediction, prediction_defaults};
pub use result::IndexResult;
