//! Error types for differentially private training.

/// Errors raised by the privacy mechanism.
///
/// None of these are recovered from inside the mechanism: every variant
/// surfaces to the training loop so a run never continues with a
/// mis-calibrated or partially applied guarantee.
#[derive(Debug, thiserror::Error)]
pub enum DpError {
    /// Invalid configuration or argument.
    #[error("invalid configuration: {msg}")]
    Validation {
        /// Human-readable error description.
        msg: String,
    },

    /// No noise multiplier in the search range meets the privacy target.
    #[error(
        "calibration failed for eps={target_epsilon:.4}, delta={target_delta:.2e} \
         over {steps} steps: {msg}"
    )]
    Calibration {
        /// Requested epsilon.
        target_epsilon: f64,
        /// Requested delta.
        target_delta: f64,
        /// Planned number of logical steps.
        steps: u64,
        /// Human-readable error description.
        msg: String,
    },

    /// Non-finite values encountered during gradient processing.
    #[error("numerical error: {msg}")]
    Numerical {
        /// Human-readable error description.
        msg: String,
    },

    /// A physical batch could not be processed with the available resources.
    #[error("resource exhausted: {msg}")]
    Resource {
        /// Human-readable error description.
        msg: String,
    },

    /// Operation not permitted in the current engine state.
    #[error("invalid state: {msg}")]
    InvalidState {
        /// Human-readable error description.
        msg: String,
    },
}

/// Result type for DP operations.
pub type Result<T> = std::result::Result<T, DpError>;

impl DpError {
    /// Create a validation error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::Validation { msg: msg.into() }
    }

    /// Create a calibration error.
    pub fn calibration<S: Into<String>>(
        target_epsilon: f64,
        target_delta: f64,
        steps: u64,
        msg: S,
    ) -> Self {
        Self::Calibration {
            target_epsilon,
            target_delta,
            steps,
            msg: msg.into(),
        }
    }

    /// Create a numerical error.
    pub fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::Numerical { msg: msg.into() }
    }

    /// Create a resource error.
    pub fn resource<S: Into<String>>(msg: S) -> Self {
        Self::Resource { msg: msg.into() }
    }

    /// Create an invalid-state error.
    pub fn state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState { msg: msg.into() }
    }

    /// Whether this error was raised while validating configuration.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Whether this error was raised by noise calibration.
    pub fn is_calibration(&self) -> bool {
        matches!(self, Self::Calibration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_error_mentions_target() {
        let err = DpError::calibration(0.01, 1e-5, 5_000, "no sigma found");
        let text = err.to_string();
        assert!(text.contains("eps=0.0100"));
        assert!(text.contains("5000 steps"));
        assert!(err.is_calibration());
    }

    #[test]
    fn helpers_pick_variants() {
        assert!(DpError::invalid("x").is_validation());
        assert!(matches!(DpError::numerical("x"), DpError::Numerical { .. }));
        assert!(matches!(DpError::resource("x"), DpError::Resource { .. }));
        assert!(matches!(DpError::state("x"), DpError::InvalidState { .. }));
    }
}
