use thiserror::Error;

use crate::domain::ModelPart;

/// Every failure the pipeline can surface to a caller.
///
/// Degenerate years (no positive catch, failed grid prediction) are *not*
/// errors; they are recorded as [`crate::domain::YearStatus`] values.
#[derive(Debug, Clone, Error)]
pub enum SurveyIndexError {
    /// Inconsistent run configuration, detected before any fitting starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed formula text or a formula that does not match the data.
    #[error("formula error: {0}")]
    Formula(String),

    /// A model fit for one age class did not converge or broke numerically.
    #[error("fitting failed for age index {age} ({part} model): {message}")]
    Fitting {
        age: usize,
        part: ModelPart,
        message: String,
    },

    /// Low-level numerical failure inside the solver.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Input file could not be read.
    #[error("{0}")]
    Io(String),

    /// Input file was read but its content is invalid.
    #[error("{0}")]
    Parse(String),
}

impl SurveyIndexError {
    /// Process exit code used by the `survey-index` binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            SurveyIndexError::Configuration(_)
            | SurveyIndexError::Formula(_)
            | SurveyIndexError::Io(_)
            | SurveyIndexError::Parse(_) => 2,
            SurveyIndexError::Fitting { .. } => 3,
            SurveyIndexError::Numerical(_) => 4,
        }
    }

    /// Attach the age and model part to a solver error.
    pub fn into_fitting(self, age: usize, part: ModelPart) -> Self {
        match self {
            already @ SurveyIndexError::Fitting { .. } => already,
            other => SurveyIndexError::Fitting {
                age,
                part,
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, SurveyIndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitting_error_names_age_and_part() {
        let err = SurveyIndexError::Numerical("matrix not positive definite".to_string())
            .into_fitting(2, ModelPart::Zero);
        let text = err.to_string();
        assert!(text.contains("age index 2"), "{text}");
        assert!(text.contains("zero"), "{text}");
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn configuration_errors_exit_with_input_code() {
        let err = SurveyIndexError::Configuration("length mismatch".to_string());
        assert_eq!(err.exit_code(), 2);
    }
}
