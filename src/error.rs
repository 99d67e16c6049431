//! Error types of the smoothing and propagation core.

use thiserror::Error;

/// Errors raised by the core analysis routines.
///
/// All of them are local and synchronous: the faulting call fails and
/// nothing is substituted or dropped to route around the bad input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// Fewer points than the fit needs.
    #[error("insufficient data: need at least {required} points, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// No variation in times or values.
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// Invalid parameter value.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
}

impl AnalysisError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
