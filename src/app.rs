//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - loads configuration and inputs
//! - runs the per-age index pipeline
//! - prints the index table and diagnostics

use clap::Parser;

use crate::cli::{CheckArgs, Command, RunArgs};
use crate::error::Result;

pub mod pipeline;

/// Entry point for the `survey-index` binary.
pub fn run() -> Result<()> {
    let cli = crate::cli::Cli::parse();

    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Check(args) => handle_check(args),
    }
}

fn handle_run(args: RunArgs) -> Result<()> {
    let run = pipeline::run_index(&args)?;

    println!("{}", crate::report::format_run_summary(&run));
    println!("{}", crate::report::format_index_table(&run.result));
    if !args.quiet {
        println!("{}", crate::report::format_diagnostics(&run.result));
    }

    Ok(())
}

fn handle_check(args: CheckArgs) -> Result<()> {
    let (config, specs) = pipeline::check_config(&args.config, &args.overrides)?;
    println!("{}", crate::report::format_check(&config, &specs));
    Ok(())
}
