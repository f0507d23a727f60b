//! Calibrated Gaussian noise for the aggregated gradient.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{DpError, Result};
use crate::params::Gradient;
use crate::tensor::{Scalar, Tensor};

/// Add N(0, std²) noise to every coordinate of a tensor in place.
///
/// A zero standard deviation leaves the tensor unchanged.
pub fn add_gaussian_noise<R: Rng + ?Sized>(
    tensor: &mut Tensor,
    std: f64,
    rng: &mut R,
) -> Result<()> {
    if std == 0.0 || tensor.is_empty() {
        return Ok(());
    }
    let dist = Normal::new(0.0, std)
        .map_err(|e| DpError::invalid(format!("invalid noise std {std}: {e}")))?;
    tensor.mapv_inplace(|x| x + (dist.sample(rng) as Scalar));
    Ok(())
}

/// Process-scoped random source for privacy-relevant draws.
///
/// Feeds both the Gaussian noise and Poisson batch sampling. Tests seed it
/// explicitly; production runs seed it from OS entropy.
#[derive(Clone, Debug)]
pub struct NoiseSource {
    rng: ChaCha20Rng,
    seed: Option<u64>,
}

impl NoiseSource {
    /// Deterministic source for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed: Some(seed),
        }
    }

    /// Source seeded from operating-system entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha20Rng::from_entropy(),
            seed: None,
        }
    }

    /// Seed used at construction, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Independent child source seeded from this one's stream.
    ///
    /// A seeded parent yields the same child every run.
    pub fn split(&mut self) -> Result<Self> {
        let rng = ChaCha20Rng::from_rng(&mut self.rng)
            .map_err(|e| DpError::resource(format!("cannot derive random source: {e}")))?;
        Ok(Self { rng, seed: None })
    }

    /// Underlying generator.
    pub fn rng(&mut self) -> &mut ChaCha20Rng {
        &mut self.rng
    }
}

/// Gaussian noise injector for DP-SGD.
///
/// Given the sum of clipped per-example gradients over a logical batch of
/// size `B`, produces `sum / B + N(0, (σ·C/B)²)` per coordinate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoiseInjector {
    noise_multiplier: f64,
    max_grad_norm: f64,
}

impl NoiseInjector {
    /// Create an injector; both σ and `C` must be positive and finite.
    pub fn new(noise_multiplier: f64, max_grad_norm: f64) -> Result<Self> {
        if !noise_multiplier.is_finite() || noise_multiplier <= 0.0 {
            return Err(DpError::invalid(format!(
                "noise_multiplier must be positive and finite, got {noise_multiplier}"
            )));
        }
        if !max_grad_norm.is_finite() || max_grad_norm <= 0.0 {
            return Err(DpError::invalid(format!(
                "max_grad_norm must be positive and finite, got {max_grad_norm}"
            )));
        }
        Ok(Self {
            noise_multiplier,
            max_grad_norm,
        })
    }

    /// Noise multiplier σ.
    pub fn noise_multiplier(&self) -> f64 {
        self.noise_multiplier
    }

    /// Clipping threshold `C` the noise is calibrated to.
    pub fn max_grad_norm(&self) -> f64 {
        self.max_grad_norm
    }

    /// Per-coordinate standard deviation of the noise on the mean gradient.
    pub fn std_for(&self, logical_batch_size: usize) -> f64 {
        self.noise_multiplier * self.max_grad_norm / logical_batch_size as f64
    }

    /// Average a clipped sum over `logical_batch_size` and add noise.
    pub fn privatize<R: Rng + ?Sized>(
        &self,
        clipped_sum: &Gradient,
        logical_batch_size: usize,
        rng: &mut R,
    ) -> Result<Gradient> {
        if logical_batch_size == 0 {
            return Err(DpError::invalid("logical batch size must be positive"));
        }
        let std = self.std_for(logical_batch_size);
        let mut out = clipped_sum.scaled(1.0 / logical_batch_size as f64);
        for leaf in out.leaves_mut() {
            add_gaussian_noise(leaf, std, rng)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn test_gaussian_deterministic() {
        let mut a = NoiseSource::seeded(42);
        let mut t1 = Array1::zeros(100).into_dyn();
        add_gaussian_noise(&mut t1, 1.0, a.rng()).expect("valid std");

        let mut b = NoiseSource::seeded(42);
        let mut t2 = Array1::zeros(100).into_dyn();
        add_gaussian_noise(&mut t2, 1.0, b.rng()).expect("valid std");

        assert_eq!(t1, t2);
    }

    #[test]
    fn split_is_reproducible_and_distinct() {
        let mut parent = NoiseSource::seeded(42);
        assert_eq!(parent.seed(), Some(42));
        let mut child = parent.split().expect("derived");
        assert_eq!(child.seed(), None);
        let mut again = NoiseSource::seeded(42).split().expect("derived");
        let x: u64 = child.rng().gen();
        assert_eq!(x, again.rng().gen::<u64>());
        assert_ne!(x, parent.rng().gen::<u64>());
    }

    #[test]
    fn test_gaussian_statistics() {
        let mut src = NoiseSource::seeded(123);
        let mut t = Array1::zeros(20_000).into_dyn();
        add_gaussian_noise(&mut t, 2.0, src.rng()).expect("valid std");

        let n = t.len() as f64;
        let mean: f64 = t.iter().map(|&x| x as f64).sum::<f64>() / n;
        let var: f64 = t.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n;

        assert!(mean.abs() < 0.1);
        assert!((var - 4.0).abs() < 0.2);
    }

    #[test]
    fn std_uses_logical_batch_size() {
        let injector = NoiseInjector::new(1.5, 2.0).expect("valid");
        assert!((injector.std_for(4) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn privatize_averages_and_noises() {
        let injector = NoiseInjector::new(1.0, 1.0).expect("valid");
        let sum = Gradient::new(vec![Array1::from_elem(50_000, 8.0).into_dyn()]);
        let mut src = NoiseSource::seeded(7);
        let noised = injector.privatize(&sum, 4, src.rng()).expect("privatized");
        let leaf = &noised.leaves()[0];
        let n = leaf.len() as f64;
        let mean = leaf.iter().map(|&x| x as f64).sum::<f64>() / n;
        let var = leaf.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!((mean - 2.0).abs() < 0.01);
        assert!((var.sqrt() - 0.25).abs() < 0.01);
    }

    #[test]
    fn zero_sigma_is_rejected() {
        assert!(NoiseInjector::new(0.0, 1.0).is_err());
        assert!(NoiseInjector::new(-1.0, 1.0).is_err());
        assert!(NoiseInjector::new(1.0, 0.0).is_err());
    }
}
