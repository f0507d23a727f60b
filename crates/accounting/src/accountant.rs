//! The accountant capability and its strategy selection.

use serde::{Deserialize, Serialize};

use dp_train_core::{DpError, Result};

use crate::calibrate::{calibrate_noise_multiplier, CalibrationOptions};
use crate::gdp::GdpAccountant;
use crate::params::{validate_delta, validate_noise_multiplier, validate_sample_rate};
use crate::rdp::RdpAccountant;

/// Privacy accountant for repeated Poisson-subsampled Gaussian steps.
///
/// Implementors supply the composition theorem through
/// [`compute_epsilon_impl`](Self::compute_epsilon_impl); argument validation,
/// step queries and calibration are shared.
pub trait Accountant {
    /// Short name of the composition method.
    fn mechanism(&self) -> &'static str;

    /// Noise multiplier σ being tracked.
    fn noise_multiplier(&self) -> f64;

    /// Sample rate `q` being tracked.
    fn sample_rate(&self) -> f64;

    /// Completed logical steps.
    fn steps(&self) -> u64;

    /// Advance by exactly one logical step.
    fn record_step(&mut self);

    /// Search bounds used by [`calibrate_sigma`](Self::calibrate_sigma).
    fn calibration_options(&self) -> &CalibrationOptions;

    /// Epsilon after `steps` compositions; arguments are already validated
    /// and `steps > 0`.
    fn compute_epsilon_impl(
        &self,
        noise_multiplier: f64,
        sample_rate: f64,
        steps: u64,
        delta: f64,
    ) -> Result<f64>;

    /// Epsilon after `steps` compositions of a mechanism with σ and `q`.
    fn compute_epsilon(
        &self,
        noise_multiplier: f64,
        sample_rate: f64,
        steps: u64,
        delta: f64,
    ) -> Result<f64> {
        validate_noise_multiplier(noise_multiplier)?;
        validate_sample_rate(sample_rate)?;
        validate_delta(delta)?;
        if steps == 0 {
            return Ok(0.0);
        }
        let eps = self.compute_epsilon_impl(noise_multiplier, sample_rate, steps, delta)?;
        if eps.is_nan() {
            return Err(DpError::numerical(format!(
                "{} accountant produced NaN epsilon",
                self.mechanism()
            )));
        }
        Ok(eps.max(0.0))
    }

    /// Epsilon at `delta` after `steps` steps of the tracked mechanism.
    fn epsilon_at(&self, delta: f64, steps: u64) -> Result<f64> {
        self.compute_epsilon(self.noise_multiplier(), self.sample_rate(), steps, delta)
    }

    /// Epsilon at `delta` for the steps recorded so far.
    fn epsilon(&self, delta: f64) -> Result<f64> {
        self.epsilon_at(delta, self.steps())
    }

    /// Smallest σ for which `planned_steps` steps at `sample_rate` stay
    /// within `(target_epsilon, target_delta)`.
    fn calibrate_sigma(
        &self,
        target_epsilon: f64,
        target_delta: f64,
        planned_steps: u64,
        sample_rate: f64,
    ) -> Result<f64> {
        calibrate_noise_multiplier(
            |sigma| self.compute_epsilon(sigma, sample_rate, planned_steps, target_delta),
            target_epsilon,
            target_delta,
            planned_steps,
            sample_rate,
            self.calibration_options(),
        )
    }
}

/// Which composition method to account with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountantKind {
    /// Rényi-DP moments accountant.
    #[default]
    Rdp,
    /// Gaussian-DP central-limit accountant.
    Gdp,
}

impl AccountantKind {
    /// Build an accountant of this kind tracking σ and `q`.
    pub fn build(
        self,
        noise_multiplier: f64,
        sample_rate: f64,
        options: CalibrationOptions,
    ) -> Result<AnyAccountant> {
        Ok(match self {
            Self::Rdp => AnyAccountant::Rdp(
                RdpAccountant::new(noise_multiplier, sample_rate)?.with_calibration(options),
            ),
            Self::Gdp => AnyAccountant::Gdp(
                GdpAccountant::new(noise_multiplier, sample_rate)?.with_calibration(options),
            ),
        })
    }

    /// Calibrate σ for a target and return a fresh accountant tracking it.
    pub fn calibrated(
        self,
        target_epsilon: f64,
        target_delta: f64,
        planned_steps: u64,
        sample_rate: f64,
        options: CalibrationOptions,
    ) -> Result<AnyAccountant> {
        // The searcher's own σ is irrelevant to the search.
        let searcher = self.build(options.sigma_max, sample_rate, options)?;
        let sigma =
            searcher.calibrate_sigma(target_epsilon, target_delta, planned_steps, sample_rate)?;
        self.build(sigma, sample_rate, options)
    }
}

/// Enum dispatch over the available accountants.
#[derive(Clone, Debug)]
pub enum AnyAccountant {
    /// Rényi-DP accountant.
    Rdp(RdpAccountant),
    /// Gaussian-DP accountant.
    Gdp(GdpAccountant),
}

impl AnyAccountant {
    /// The kind of the wrapped accountant.
    pub fn kind(&self) -> AccountantKind {
        match self {
            Self::Rdp(_) => AccountantKind::Rdp,
            Self::Gdp(_) => AccountantKind::Gdp,
        }
    }

    fn inner(&self) -> &dyn Accountant {
        match self {
            Self::Rdp(a) => a,
            Self::Gdp(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Accountant {
        match self {
            Self::Rdp(a) => a,
            Self::Gdp(a) => a,
        }
    }
}

impl Accountant for AnyAccountant {
    fn mechanism(&self) -> &'static str {
        self.inner().mechanism()
    }

    fn noise_multiplier(&self) -> f64 {
        self.inner().noise_multiplier()
    }

    fn sample_rate(&self) -> f64 {
        self.inner().sample_rate()
    }

    fn steps(&self) -> u64 {
        self.inner().steps()
    }

    fn record_step(&mut self) {
        self.inner_mut().record_step();
    }

    fn calibration_options(&self) -> &CalibrationOptions {
        self.inner().calibration_options()
    }

    fn compute_epsilon_impl(
        &self,
        noise_multiplier: f64,
        sample_rate: f64,
        steps: u64,
        delta: f64,
    ) -> Result<f64> {
        self.inner()
            .compute_epsilon_impl(noise_multiplier, sample_rate, steps, delta)
    }
}
