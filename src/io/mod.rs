//! Input helpers: CSV/TOML ingest + validation (`ingest`).

pub mod ingest;

pub use ingest::*;
