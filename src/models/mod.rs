//! Model building blocks: GLM families, the formula language and design
//! matrices with their smoothing penalties.
//!
//! Nothing here fits anything; the solver in `fit` consumes these pieces.

pub mod design;
pub mod family;
pub mod formula;

pub use design::{Design, DesignSpec, Penalty};
pub use family::{Distribution, GlmFamily, Link};
pub use formula::{Formula, SmoothBasis, Term};
