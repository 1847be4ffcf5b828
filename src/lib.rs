//! `survey-index` library crate.
//!
//! Age-based abundance indices from scientific trawl surveys: per age class a
//! two-part (delta) GAM is fitted to haul catches, predicted over a spatial
//! grid for every year and summed, with coefficient-simulation confidence
//! intervals.
//!
//! The binary (`survey-index`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the pipeline can be driven from other Rust code via [`index::run_survey_index`]

pub mod app;
pub mod cli;
pub mod domain;
pub mod error;
pub mod fit;
pub mod index;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
