//! Mathematical utilities: spline bases, SPD solves, MVN draws, quantiles.

pub mod basis;
pub mod linalg;
pub mod mvn;
pub mod stats;

pub use basis::*;
pub use linalg::*;
pub use mvn::MultivariateNormal;
