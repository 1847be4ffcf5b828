//! Reporting: formatted index tables and model diagnostics.

pub mod format;

pub use format::*;
