//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - observation and grid inputs (`HaulRecord`, `GridCell`)
//! - covariate tables read by formulas (`Frame`)
//! - per-age model configuration (`ModelSpec`, `RunConfig`)

pub mod config;
pub mod frame;
pub mod types;

pub use config::*;
pub use frame::{Column, Frame};
pub use types::*;
