//! Privacy budget and run-level parameters.

use serde::{Deserialize, Serialize};

use dp_train_core::{logical_batches_per_epoch, DpError, PartialBatchPolicy, Result};

/// Target guarantee and sensitivity bound for a training run.
///
/// Immutable once training starts; used exactly once to calibrate σ.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    /// Target epsilon.
    pub target_epsilon: f64,
    /// Target delta, in (0, 1).
    pub target_delta: f64,
    /// Per-example clipping threshold `C`.
    pub max_grad_norm: f64,
}

impl PrivacyBudget {
    /// Create and validate a budget.
    pub fn new(target_epsilon: f64, target_delta: f64, max_grad_norm: f64) -> Result<Self> {
        let budget = Self {
            target_epsilon,
            target_delta,
            max_grad_norm,
        };
        budget.validate()?;
        Ok(budget)
    }

    /// Validate the budget.
    pub fn validate(&self) -> Result<()> {
        if !self.target_epsilon.is_finite() || self.target_epsilon <= 0.0 {
            return Err(DpError::invalid(format!(
                "target_epsilon must be positive and finite, got {}",
                self.target_epsilon
            )));
        }
        validate_delta(self.target_delta)?;
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(DpError::invalid(format!(
                "max_grad_norm must be positive and finite, got {}",
                self.max_grad_norm
            )));
        }
        Ok(())
    }
}

/// Reject deltas outside (0, 1).
pub fn validate_delta(delta: f64) -> Result<()> {
    if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
        return Err(DpError::invalid(format!("delta must lie in (0, 1), got {delta}")));
    }
    Ok(())
}

/// Reject sample rates outside (0, 1].
pub fn validate_sample_rate(q: f64) -> Result<()> {
    if !q.is_finite() || q <= 0.0 || q > 1.0 {
        return Err(DpError::invalid(format!("sample rate must lie in (0, 1], got {q}")));
    }
    Ok(())
}

/// Reject non-positive or non-finite noise multipliers.
pub fn validate_noise_multiplier(sigma: f64) -> Result<()> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(DpError::invalid(format!(
            "noise multiplier must be positive and finite, got {sigma}"
        )));
    }
    Ok(())
}

/// Sample rate `q = B / N`.
pub fn sample_rate(logical_batch_size: usize, dataset_size: usize) -> Result<f64> {
    if dataset_size == 0 {
        return Err(DpError::invalid("dataset size must be positive"));
    }
    if logical_batch_size == 0 {
        return Err(DpError::invalid("logical batch size must be positive"));
    }
    if logical_batch_size > dataset_size {
        return Err(DpError::invalid(format!(
            "logical batch size {logical_batch_size} exceeds dataset size {dataset_size}"
        )));
    }
    let q = logical_batch_size as f64 / dataset_size as f64;
    validate_sample_rate(q)?;
    Ok(q)
}

/// Planned logical steps: `epochs` × logical batches per epoch.
pub fn planned_steps(
    dataset_size: usize,
    logical_batch_size: usize,
    epochs: usize,
    policy: PartialBatchPolicy,
) -> Result<u64> {
    if epochs == 0 {
        return Err(DpError::invalid("epochs must be positive"));
    }
    sample_rate(logical_batch_size, dataset_size)?;
    let per_epoch = logical_batches_per_epoch(dataset_size, logical_batch_size, policy) as u64;
    Ok(per_epoch * epochs as u64)
}
