//! Rényi Differential Privacy accounting.
//!
//! RDP of the Poisson-subsampled Gaussian mechanism follows Mironov, Talwar
//! and Zhang (2019): integer orders use the exact binomial expansion,
//! fractional orders the two-sided erfc series. Conversion to (ε, δ) uses
//! the bound of Balle et al. (2020), minimized over orders.

use std::f64::consts::{LN_2, PI, SQRT_2};

use statrs::function::erf::erfc;
use statrs::function::factorial::ln_binomial;

use dp_train_core::Result;

use crate::accountant::Accountant;
use crate::calibrate::CalibrationOptions;
use crate::params::{validate_noise_multiplier, validate_sample_rate};

/// Series terms below this log-magnitude are dropped.
const SERIES_CUTOFF: f64 = -30.0;

/// A series that has not converged after this many terms is treated as
/// unbounded, which only ever overstates epsilon.
const MAX_SERIES_TERMS: usize = 100_000;

/// RDP accountant for a fixed noise multiplier and sample rate.
#[derive(Clone, Debug)]
pub struct RdpAccountant {
    noise_multiplier: f64,
    sample_rate: f64,
    steps: u64,
    orders: Vec<f64>,
    per_step: Vec<f64>,
    calibration: CalibrationOptions,
}

impl RdpAccountant {
    /// Create an accountant with default Rényi orders.
    pub fn new(noise_multiplier: f64, sample_rate: f64) -> Result<Self> {
        Self::with_orders(noise_multiplier, sample_rate, default_orders())
    }

    /// Create an accountant with custom orders.
    ///
    /// Orders that are not finite and greater than one are discarded; if
    /// none remain the defaults are used.
    pub fn with_orders(noise_multiplier: f64, sample_rate: f64, orders: Vec<f64>) -> Result<Self> {
        validate_noise_multiplier(noise_multiplier)?;
        validate_sample_rate(sample_rate)?;

        let mut orders: Vec<f64> = orders
            .into_iter()
            .filter(|&a| a.is_finite() && a > 1.0)
            .collect();
        orders.sort_by(|a, b| a.total_cmp(b));
        orders.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        if orders.is_empty() {
            orders = default_orders();
        }

        let per_step = compute_rdp(sample_rate, noise_multiplier, 1, &orders);
        Ok(Self {
            noise_multiplier,
            sample_rate,
            steps: 0,
            orders,
            per_step,
            calibration: CalibrationOptions::default(),
        })
    }

    /// Replace the calibration search options.
    pub fn with_calibration(mut self, options: CalibrationOptions) -> Self {
        self.calibration = options;
        self
    }

    /// Rényi orders evaluated.
    pub fn orders(&self) -> &[f64] {
        &self.orders
    }

    /// Accumulated RDP at each order for the recorded steps.
    pub fn rdp(&self) -> Vec<f64> {
        let t = self.steps as f64;
        self.per_step.iter().map(|r| r * t).collect()
    }
}

impl Accountant for RdpAccountant {
    fn mechanism(&self) -> &'static str {
        "rdp"
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
        let rdp = if noise_multiplier == self.noise_multiplier && sample_rate == self.sample_rate {
            let t = steps as f64;
            self.per_step.iter().map(|r| r * t).collect()
        } else {
            compute_rdp(sample_rate, noise_multiplier, steps, &self.orders)
        };
        Ok(rdp_to_epsilon(&self.orders, &rdp, delta).0)
    }
}

/// Default Rényi orders: 1.1 to 10.9 in steps of 0.1, the integers 12 to 63,
/// then 128 and 256.
pub fn default_orders() -> Vec<f64> {
    let mut orders: Vec<f64> = (1..100).map(|x| 1.0 + x as f64 / 10.0).collect();
    orders.extend((12..64).map(|a| a as f64));
    orders.extend([128.0, 256.0]);
    orders
}

/// RDP of `steps` compositions of the subsampled Gaussian at each order.
pub fn compute_rdp(q: f64, sigma: f64, steps: u64, orders: &[f64]) -> Vec<f64> {
    let t = steps as f64;
    orders
        .iter()
        .map(|&alpha| {
            let r = rdp_single_order(q, sigma, alpha);
            if r.is_finite() {
                r * t
            } else {
                f64::INFINITY
            }
        })
        .collect()
}

/// Convert per-order RDP to `(epsilon, optimal order)` at `delta`.
///
/// Returns infinity if no order yields a finite bound.
pub fn rdp_to_epsilon(orders: &[f64], rdp: &[f64], delta: f64) -> (f64, f64) {
    let log_delta = delta.ln();
    let mut best = (f64::INFINITY, f64::NAN);
    for (&alpha, &r) in orders.iter().zip(rdp) {
        if !r.is_finite() {
            continue;
        }
        let eps = r - (log_delta + alpha.ln()) / (alpha - 1.0) + ((alpha - 1.0) / alpha).ln();
        if eps < best.0 {
            best = (eps, alpha);
        }
    }
    best
}

fn rdp_single_order(q: f64, sigma: f64, alpha: f64) -> f64 {
    if q >= 1.0 {
        return alpha / (2.0 * sigma * sigma);
    }
    let log_a = if alpha.fract() == 0.0 {
        log_a_int(q, sigma, alpha as u64)
    } else {
        log_a_frac(q, sigma, alpha)
    };
    log_a / (alpha - 1.0)
}

/// `ln A_α` for integer α via the binomial expansion.
fn log_a_int(q: f64, sigma: f64, alpha: u64) -> f64 {
    let log_q = q.ln();
    let log_1mq = (1.0 - q).ln();
    let two_sigma_sq = 2.0 * sigma * sigma;
    let alpha_f = alpha as f64;

    let mut log_a = f64::NEG_INFINITY;
    for i in 0..=alpha {
        let i_f = i as f64;
        let log_coef = ln_binomial(alpha, i) + i_f * log_q + (alpha_f - i_f) * log_1mq;
        log_a = log_add_exp(log_a, log_coef + (i_f * i_f - i_f) / two_sigma_sq);
    }
    log_a
}

/// `ln A_α` for fractional α via the two-sided erfc series.
fn log_a_frac(q: f64, sigma: f64, alpha: f64) -> f64 {
    let log_q = q.ln();
    let log_1mq = (1.0 - q).ln();
    let two_sigma_sq = 2.0 * sigma * sigma;
    let z0 = sigma * sigma * (1.0 / q - 1.0).ln() + 0.5;

    let mut log_a0 = f64::NEG_INFINITY;
    let mut log_a1 = f64::NEG_INFINITY;
    // ln|binom(α, i)| and its sign, advanced term by term.
    let mut log_coef = 0.0_f64;
    let mut positive = true;

    for i in 0..MAX_SERIES_TERMS {
        let i_f = i as f64;
        let j = alpha - i_f;

        let log_t0 = log_coef + i_f * log_q + j * log_1mq;
        let log_t1 = log_coef + j * log_q + i_f * log_1mq;
        let log_e0 = -LN_2 + log_erfc((i_f - z0) / (SQRT_2 * sigma));
        let log_e1 = -LN_2 + log_erfc((z0 - j) / (SQRT_2 * sigma));
        let log_s0 = log_t0 + (i_f * i_f - i_f) / two_sigma_sq + log_e0;
        let log_s1 = log_t1 + (j * j - j) / two_sigma_sq + log_e1;

        if positive {
            log_a0 = log_add_exp(log_a0, log_s0);
            log_a1 = log_add_exp(log_a1, log_s1);
        } else {
            log_a0 = log_sub_exp(log_a0, log_s0);
            log_a1 = log_sub_exp(log_a1, log_s1);
        }

        if log_s0.max(log_s1) < SERIES_CUTOFF {
            return log_add_exp(log_a0, log_a1);
        }

        let factor = alpha - i_f;
        log_coef += factor.abs().ln() - (i_f + 1.0).ln();
        if factor < 0.0 {
            positive = !positive;
        }
    }
    f64::INFINITY
}

/// `ln erfc(x)`, switching to the asymptotic expansion where erfc underflows.
fn log_erfc(x: f64) -> f64 {
    if x < 25.0 {
        return erfc(x).ln();
    }
    let inv_x2 = 1.0 / (x * x);
    let series = 1.0 - 0.5 * inv_x2 + 0.75 * inv_x2 * inv_x2 - 1.875 * inv_x2 * inv_x2 * inv_x2;
    -x * x - x.ln() - 0.5 * PI.ln() + series.ln()
}

/// Numerically stable `ln(e^a + e^b)`.
fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// `ln(e^a - e^b)` for `a >= b`, clamped to `-inf` otherwise.
fn log_sub_exp(a: f64, b: f64) -> f64 {
    if b == f64::NEG_INFINITY {
        return a;
    }
    if a <= b {
        return f64::NEG_INFINITY;
    }
    a + (-(b - a).exp()).ln_1p()
}
