//! How logical batches are drawn from the dataset.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DpError, Result};
use crate::noise::NoiseSource;

/// Logical batch sampling scheme.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    /// Every example joins each logical batch independently with probability
    /// `q = B / N`. Batch sizes vary around `B`; the mean and noise scale
    /// always use `B`. This is the scheme the accountants analyze.
    #[default]
    Poisson,
    /// Shuffle once per epoch and cut into consecutive batches of `B`.
    Shuffle,
}

/// Indices of `0..n` kept independently with probability `q`, in order.
pub fn poisson_sample<R: Rng + ?Sized>(n: usize, q: f64, rng: &mut R) -> Vec<usize> {
    if n == 0 || !q.is_finite() || q <= 0.0 {
        return Vec::new();
    }
    let q = q.min(1.0);
    (0..n).filter(|_| rng.gen_bool(q)).collect()
}

/// Draws Poisson-sampled logical batches, `ceil(N / B)` per epoch.
#[derive(Clone, Debug)]
pub struct PoissonSampler {
    dataset_size: usize,
    expected_batch_size: usize,
    source: NoiseSource,
}

impl PoissonSampler {
    /// Sampler with expected batch size `B` over `N` examples.
    pub fn new(
        dataset_size: usize,
        expected_batch_size: usize,
        source: NoiseSource,
    ) -> Result<Self> {
        if dataset_size == 0 {
            return Err(DpError::invalid("dataset size must be positive"));
        }
        if expected_batch_size == 0 || expected_batch_size > dataset_size {
            return Err(DpError::invalid(format!(
                "expected batch size must lie in 1..={dataset_size}, got {expected_batch_size}"
            )));
        }
        Ok(Self {
            dataset_size,
            expected_batch_size,
            source,
        })
    }

    /// Inclusion probability `q = B / N`.
    pub fn sample_rate(&self) -> f64 {
        self.expected_batch_size as f64 / self.dataset_size as f64
    }

    /// Expected logical batch size `B`.
    pub fn expected_batch_size(&self) -> usize {
        self.expected_batch_size
    }

    /// Logical batches drawn per epoch.
    pub fn steps_per_epoch(&self) -> usize {
        (self.dataset_size + self.expected_batch_size - 1) / self.expected_batch_size
    }

    /// One logical batch.
    pub fn sample(&mut self) -> Vec<usize> {
        let q = self.sample_rate();
        poisson_sample(self.dataset_size, q, self.source.rng())
    }

    /// All logical batches of one epoch; some may be empty.
    pub fn epoch(&mut self) -> Vec<Vec<usize>> {
        (0..self.steps_per_epoch()).map(|_| self.sample()).collect()
    }
}
