//! Run configuration for the privacy engine.

use serde::{Deserialize, Serialize};

use dp_train_accounting::{AccountantKind, CalibrationOptions, PrivacyBudget};
use dp_train_core::{DpError, PartialBatchPolicy, Result, Sampling};

/// Everything the engine needs before training starts.
///
/// Logical batch size and dataset size come from the attached loader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target epsilon.
    pub target_epsilon: f64,
    /// Target delta.
    pub target_delta: f64,
    /// Per-example clipping threshold `C`.
    pub max_grad_norm: f64,
    /// Fixed noise multiplier; calibrated from the budget when unset.
    pub noise_multiplier: Option<f64>,
    /// Planned passes over the data.
    pub epochs: usize,
    /// Physical batch cap `P`.
    pub max_physical_batch_size: usize,
    /// How logical batches are drawn.
    pub sampling: Sampling,
    /// Treatment of a trailing partial logical batch under shuffle sampling.
    pub partial_batch: PartialBatchPolicy,
    /// Composition method.
    pub accountant: AccountantKind,
    /// σ search bounds.
    pub calibration: CalibrationOptions,
    /// Seed for noise and batch sampling; OS entropy when unset.
    pub seed: Option<u64>,
    /// Report epsilon every this many logical steps.
    pub report_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_epsilon: 5.0,
            target_delta: 1e-5,
            max_grad_norm: 1.2,
            noise_multiplier: None,
            epochs: 20,
            max_physical_batch_size: 128,
            sampling: Sampling::default(),
            partial_batch: PartialBatchPolicy::default(),
            accountant: AccountantKind::default(),
            calibration: CalibrationOptions::default(),
            seed: None,
            report_every: 200,
        }
    }
}

impl EngineConfig {
    /// The privacy budget part of the configuration.
    pub fn budget(&self) -> Result<PrivacyBudget> {
        PrivacyBudget::new(self.target_epsilon, self.target_delta, self.max_grad_norm)
    }

    /// Validate everything that does not depend on the loader.
    pub fn validate(&self) -> Result<()> {
        self.budget()?;
        if let Some(sigma) = self.noise_multiplier {
            if !sigma.is_finite() || sigma <= 0.0 {
                return Err(DpError::invalid(format!(
                    "noise_multiplier must be positive and finite, got {sigma}"
                )));
            }
        }
        if self.epochs == 0 {
            return Err(DpError::invalid("epochs must be positive"));
        }
        if self.max_physical_batch_size == 0 {
            return Err(DpError::invalid("max_physical_batch_size must be positive"));
        }
        if self.report_every == 0 {
            return Err(DpError::invalid("report_every must be positive"));
        }
        self.calibration.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.sampling, Sampling::Poisson);
    }

    #[test]
    fn zero_sigma_and_bad_delta_rejected() {
        let cfg = EngineConfig {
            noise_multiplier: Some(0.0),
            ..EngineConfig::default()
        };
        assert!(cfg.validate().expect_err("zero sigma").is_validation());

        let cfg = EngineConfig {
            target_delta: 1.0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            max_grad_norm: 0.0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{"target_epsilon": 3.0, "sampling": "shuffle", "partial_batch": "drop",
                "accountant": "gdp", "seed": 7}"#,
        )
        .expect("valid json");
        assert_eq!(cfg.target_epsilon, 3.0);
        assert_eq!(cfg.sampling, Sampling::Shuffle);
        assert_eq!(cfg.partial_batch, PartialBatchPolicy::Drop);
        assert_eq!(cfg.accountant, AccountantKind::Gdp);
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.max_physical_batch_size, 128);
        cfg.validate().expect("valid");
    }
}
