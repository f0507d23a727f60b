//! Noise multiplier calibration by bounded bisection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use dp_train_core::{DpError, Result};

use crate::params::{validate_delta, validate_sample_rate};

/// Search range and tolerances for σ calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOptions {
    /// Smallest σ considered.
    pub sigma_min: f64,
    /// Largest σ considered. No σ above this is ever returned.
    pub sigma_max: f64,
    /// Stop once the achieved epsilon is within this distance below the target.
    pub epsilon_tolerance: f64,
    /// Stop once the bracket on σ is narrower than this.
    pub sigma_tolerance: f64,
    /// Upper bound on bisection iterations.
    pub max_iterations: usize,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            sigma_min: 0.1,
            sigma_max: 1_000.0,
            epsilon_tolerance: 0.01,
            sigma_tolerance: 1e-4,
            max_iterations: 200,
        }
    }
}

impl CalibrationOptions {
    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if !self.sigma_min.is_finite() || self.sigma_min <= 0.0 {
            return Err(DpError::invalid("sigma_min must be positive and finite"));
        }
        if !self.sigma_max.is_finite() || self.sigma_max <= self.sigma_min {
            return Err(DpError::invalid("sigma_max must be finite and exceed sigma_min"));
        }
        if self.epsilon_tolerance.is_nan() || self.epsilon_tolerance < 0.0 {
            return Err(DpError::invalid("epsilon_tolerance must be non-negative"));
        }
        if self.sigma_tolerance.is_nan() || self.sigma_tolerance <= 0.0 {
            return Err(DpError::invalid("sigma_tolerance must be positive"));
        }
        if self.max_iterations == 0 {
            return Err(DpError::invalid("max_iterations must be positive"));
        }
        Ok(())
    }
}

/// Find the smallest σ in range with `epsilon_for(σ) <= target_epsilon`.
///
/// `epsilon_for` must be non-increasing in σ. Fails with
/// [`DpError::Calibration`] when even `sigma_max` misses the target.
pub fn calibrate_noise_multiplier<F>(
    epsilon_for: F,
    target_epsilon: f64,
    target_delta: f64,
    planned_steps: u64,
    sample_rate: f64,
    options: &CalibrationOptions,
) -> Result<f64>
where
    F: Fn(f64) -> Result<f64>,
{
    options.validate()?;
    if !target_epsilon.is_finite() || target_epsilon <= 0.0 {
        return Err(DpError::invalid(format!(
            "target_epsilon must be positive and finite, got {target_epsilon}"
        )));
    }
    validate_delta(target_delta)?;
    validate_sample_rate(sample_rate)?;
    if planned_steps == 0 {
        return Err(DpError::invalid("planned_steps must be positive"));
    }

    // NaN compares false, so it counts as a miss.
    let meets = |eps: f64| eps <= target_epsilon;

    let eps_at_max = epsilon_for(options.sigma_max)?;
    if !meets(eps_at_max) {
        return Err(DpError::calibration(
            target_epsilon,
            target_delta,
            planned_steps,
            format!(
                "epsilon is {eps_at_max:.4} even at sigma_max={}",
                options.sigma_max
            ),
        ));
    }
    if meets(epsilon_for(options.sigma_min)?) {
        return Ok(options.sigma_min);
    }

    let mut lo = options.sigma_min;
    let mut hi = options.sigma_max;
    let mut eps_hi = eps_at_max;
    let mut iterations = 0;
    while iterations < options.max_iterations && hi - lo > options.sigma_tolerance {
        iterations += 1;
        let mid = 0.5 * (lo + hi);
        let eps = epsilon_for(mid)?;
        if meets(eps) {
            hi = mid;
            eps_hi = eps;
            if target_epsilon - eps <= options.epsilon_tolerance {
                break;
            }
        } else {
            lo = mid;
        }
    }

    debug!(
        sigma = hi,
        epsilon = eps_hi,
        iterations,
        "noise multiplier search converged"
    );
    Ok(hi)
}
