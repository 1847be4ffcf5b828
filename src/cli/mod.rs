//! Command-line parsing for the survey index tool.
//!
//! Argument parsing and command dispatch stay separate from the modelling
//! code; everything model-related lives in the TOML run configuration and
//! only a few run-level knobs can be overridden here.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::RunConfig;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "survey-index",
    version,
    about = "Age-based survey abundance indices from delta GAMs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit all age classes, predict the grid and print the index table.
    Run(RunArgs),
    /// Validate the configuration and formulas without fitting.
    Check(CheckArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Haul observations (CSV with one count column per age class).
    #[arg(long, value_name = "CSV")]
    pub hauls: PathBuf,

    /// Prediction grid (CSV with lon, lat, depth).
    #[arg(long, value_name = "CSV")]
    pub grid: PathBuf,

    /// Run configuration (TOML).
    #[arg(long, value_name = "TOML")]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: Overrides,

    /// Skip the per-age model diagnostics.
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Args)]
pub struct CheckArgs {
    /// Run configuration (TOML).
    #[arg(long, value_name = "TOML")]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: Overrides,
}

/// Run-level settings that take precedence over the configuration file.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Base random seed (age `a` uses `seed + a`).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Worker threads fitting age classes in parallel.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Bootstrap draws (10 or fewer disables the bootstrap).
    #[arg(long = "n-boot")]
    pub n_boot: Option<usize>,

    /// Confidence level of the bootstrap intervals.
    #[arg(long = "ci-level")]
    pub ci_level: Option<f64>,
}

impl Overrides {
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(n_boot) = self.n_boot {
            config.n_boot = n_boot;
        }
        if let Some(ci_level) = self.ci_level {
            config.ci_level = ci_level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_overrides() {
        let cli = Cli::parse_from([
            "survey-index",
            "run",
            "--hauls",
            "hauls.csv",
            "--grid",
            "grid.csv",
            "--config",
            "run.toml",
            "--seed",
            "7",
            "--n-boot",
            "0",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.hauls, PathBuf::from("hauls.csv"));

        let mut config = RunConfig::default();
        args.overrides.apply(&mut config);
        assert_eq!(config.seed, 7);
        assert_eq!(config.n_boot, 0);
        assert_eq!(config.workers, RunConfig::default().workers);
    }

    #[test]
    fn check_needs_only_config() {
        let cli = Cli::parse_from(["survey-index", "check", "--config", "run.toml"]);
        assert!(matches!(cli.command, Command::Check(_)));
    }
}
