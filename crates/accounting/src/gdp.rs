//! Gaussian Differential Privacy accounting.
//!
//! Uses the central limit theorem of Bu, Dong, Long and Su (2020): `T`
//! Poisson-subsampled Gaussian steps are approximately `μ`-GDP with
//! `μ = q·√T·√(e^{1/σ²} − 1)`. The approximation is asymptotic and can
//! understate epsilon for few steps or large sample rates, so RDP remains
//! the default.

use std::f64::consts::SQRT_2;

use statrs::function::erf::erfc;

use dp_train_core::Result;

use crate::accountant::Accountant;
use crate::calibrate::CalibrationOptions;
use crate::params::{validate_noise_multiplier, validate_sample_rate};

const MAX_EPSILON: f64 = 1e4;
const BISECTION_STEPS: usize = 200;

/// GDP accountant for a fixed noise multiplier and sample rate.
#[derive(Clone, Debug)]
pub struct GdpAccountant {
    noise_multiplier: f64,
    sample_rate: f64,
    steps: u64,
    calibration: CalibrationOptions,
}

impl GdpAccountant {
    /// Create a GDP accountant.
    pub fn new(noise_multiplier: f64, sample_rate: f64) -> Result<Self> {
        validate_noise_multiplier(noise_multiplier)?;
        validate_sample_rate(sample_rate)?;
        Ok(Self {
            noise_multiplier,
            sample_rate,
            steps: 0,
            calibration: CalibrationOptions::default(),
        })
    }

    /// Replace the calibration search options.
    pub fn with_calibration(mut self, options: CalibrationOptions) -> Self {
        self.calibration = options;
        self
    }

    /// The GDP parameter `μ` after the recorded steps.
    pub fn mu(&self) -> f64 {
        compute_mu(self.sample_rate, self.noise_multiplier, self.steps)
    }
}

impl Accountant for GdpAccountant {
    fn mechanism(&self) -> &'static str {
        "gdp"
    }

    fn noise_multiplier(&self) -> f64 {
        self.noise_multiplier
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn steps(&self) -> u64 {
        self.steps
    }

    fn record_step(&mut self) {
        self.steps += 1;
    }

    fn calibration_options(&self) -> &CalibrationOptions {
        &self.calibration
    }

    fn compute_epsilon_impl(
        &self,
        noise_multiplier: f64,
        sample_rate: f64,
        steps: u64,
        delta: f64,
    ) -> Result<f64> {
        let mu = compute_mu(sample_rate, noise_multiplier, steps);
        Ok(eps_from_mu(mu, delta))
    }
}

/// `μ = q·√T·√(e^{1/σ²} − 1)`.
pub fn compute_mu(q: f64, sigma: f64, steps: u64) -> f64 {
    q * (steps as f64).sqrt() * (1.0 / (sigma * sigma)).exp_m1().sqrt()
}

/// Standard normal CDF.
fn phi(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Smallest δ for which `μ`-GDP implies (ε, δ)-DP.
pub fn delta_for_epsilon(mu: f64, eps: f64) -> f64 {
    let a = phi(-eps / mu + mu / 2.0);
    // e^ε·Φ(·) computed in log space so large ε cannot overflow.
    let b = (eps + phi(-eps / mu - mu / 2.0).ln()).exp();
    (a - b).max(0.0)
}

/// Smallest ε with `delta_for_epsilon(mu, ε) <= delta`, by bisection.
pub fn eps_from_mu(mu: f64, delta: f64) -> f64 {
    if mu == 0.0 {
        return 0.0;
    }
    if !mu.is_finite() {
        return f64::INFINITY;
    }
    if delta_for_epsilon(mu, 0.0) <= delta {
        return 0.0;
    }
    let mut hi = 1.0;
    while delta_for_epsilon(mu, hi) > delta {
        hi *= 2.0;
        if hi > MAX_EPSILON {
            return f64::INFINITY;
        }
    }
    let mut lo = 0.0;
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if delta_for_epsilon(mu, mid) > delta {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-10 {
            break;
        }
    }
    hi
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mu_matches_closed_form() {
        let mu = compute_mu(0.01, 1.0, 10_000);
        let expected = 0.01 * 100.0 * (std::f64::consts::E - 1.0).sqrt();
        assert!((mu - expected).abs() < 1e-12);
    }

    #[test]
    fn epsilon_inverts_delta() {
        let mu = 0.8;
        let eps = eps_from_mu(mu, 1e-5);
        assert!(eps > 0.0 && eps.is_finite());
        let delta = delta_for_epsilon(mu, eps);
        assert!(delta <= 1e-5);
        assert!((delta - 1e-5).abs() < 1e-7);
    }

    #[test]
    fn epsilon_grows_with_steps() {
        let acc = GdpAccountant::new(1.0, 0.004).expect("valid");
        let a = acc.epsilon_at(1e-5, 100).expect("valid");
        let b = acc.epsilon_at(1e-5, 5_000).expect("valid");
        assert!(b > a);
    }

    #[test]
    fn record_step_updates_mu() {
        let mut acc = GdpAccountant::new(1.2, 0.01).expect("valid");
        assert_eq!(acc.mu(), 0.0);
        for _ in 0..4 {
            acc.record_step();
        }
        assert!((acc.mu() - compute_mu(0.01, 1.2, 4)).abs() < 1e-15);
    }

    #[test]
    fn calibration_round_trip() {
        let acc = GdpAccountant::new(1.0, 0.004).expect("valid");
        let sigma = acc.calibrate_sigma(3.0, 1e-5, 5_000, 0.004).expect("feasible");
        let eps = acc.compute_epsilon(sigma, 0.004, 5_000, 1e-5).expect("valid");
        assert!(eps <= 3.0);
        assert!(3.0 - eps < 0.05);
    }

    proptest! {
        #[test]
        fn prop_epsilon_monotone(
            sigma in 0.6f64..4.0,
            bump in 0.05f64..1.0,
            q in 0.001f64..0.05,
            t in 1u64..5_000,
            extra in 1u64..5_000,
        ) {
            let acc = GdpAccountant::new(sigma, q).expect("valid");
            let now = acc.epsilon_at(1e-5, t).expect("valid");
            let later = acc.epsilon_at(1e-5, t + extra).expect("valid");
            prop_assert!(later + 1e-8 >= now);

            let quieter = GdpAccountant::new(sigma + bump, q).expect("valid");
            let eps = quieter.epsilon_at(1e-5, t).expect("valid");
            prop_assert!(eps <= now + 1e-8);
        }
    }
}
