//! Model fitting.
//!
//! Responsibilities:
//!
//! - select smoothing parameters on the working model (`smoothing`)
//! - fit one penalised GLM by P-IRLS (`solver`)
//! - fit the zero and positive parts of an age class (`two_part`)

pub mod smoothing;
pub mod solver;
pub mod two_part;

pub use solver::{FitRequest, FittedSmooth, PenalizedIrls, SmoothRegression, linear_predictor};
pub use two_part::{FittedModelPair, TwoPartModelFitter};
