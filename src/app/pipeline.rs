//! Shared "index pipeline" logic behind the CLI commands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! config load -> overrides -> validation -> ingest -> per-age fit/predict/bootstrap
//!
//! The commands can then focus on presentation.

use std::path::Path;

use crate::cli::{Overrides, RunArgs};
use crate::domain::{GridCell, HaulRecord, ModelSpec, RunConfig};
use crate::error::Result;
use crate::index::{IndexResult, run_survey_index};
use crate::io::ingest::{Ingested, load_grid, load_hauls, load_run_config};

/// All computed outputs of a single `survey-index run`.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub config: RunConfig,
    pub hauls: Ingested<HaulRecord>,
    pub grid: Ingested<GridCell>,
    pub result: IndexResult,
}

/// Load the TOML configuration and apply command-line overrides.
pub fn load_config(path: &Path, overrides: &Overrides) -> Result<RunConfig> {
    let mut config = load_run_config(path)?;
    overrides.apply(&mut config);
    Ok(config)
}

/// Validate a configuration (including every formula) without fitting.
pub fn check_config(path: &Path, overrides: &Overrides) -> Result<(RunConfig, Vec<ModelSpec>)> {
    let config = load_config(path, overrides)?;
    let specs = config.model_specs()?;
    Ok((config, specs))
}

/// Execute the full index pipeline and return the computed outputs.
pub fn run_index(args: &RunArgs) -> Result<RunOutput> {
    // 1) Configuration first: a bad config fails before any file is parsed.
    let config = load_config(&args.config, &args.overrides)?;
    config.model_specs()?;

    // 2) Inputs.
    let hauls = load_hauls(&args.hauls, &config.ages)?;
    let grid = load_grid(&args.grid)?;
    log::info!(
        "loaded {} hauls ({} skipped) and {} grid cells ({} skipped)",
        hauls.rows.len(),
        hauls.row_errors.len(),
        grid.rows.len(),
        grid.row_errors.len()
    );

    // 3) Fit, predict and bootstrap every age.
    let result = run_survey_index(&hauls.rows, &grid.rows, &config)?;

    Ok(RunOutput {
        config,
        hauls,
        grid,
        result,
    })
}
