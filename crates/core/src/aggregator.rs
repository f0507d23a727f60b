//! DP-SGD aggregation across the physical batches of one logical step.

use tracing::debug;

use crate::clipping::{ClippedSum, GradientClipper};
use crate::error::{DpError, Result};
use crate::noise::{NoiseInjector, NoiseSource};
use crate::params::{Gradient, ShapeSpec};

/// Summary of a finished logical step.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateStats {
    /// Number of examples whose clipped gradients entered the sum.
    pub examples: usize,
    /// `B` used for averaging and noise scale.
    pub logical_batch_size: usize,
    /// Fraction of examples whose norm exceeded `C`.
    pub clipped_fraction: f64,
    /// Per-coordinate noise standard deviation on the mean gradient.
    pub noise_std: f64,
}

/// Stateful DP-SGD aggregator.
///
/// Physical batches are clipped and folded into a running sum with
/// [`accumulate`](Self::accumulate). Noise is drawn exactly once per logical
/// batch, in [`finish`](Self::finish), so splitting a logical batch into any
/// number of physical batches leaves the noise scale untouched.
#[derive(Clone, Debug)]
pub struct DpSgdAggregator {
    clipper: GradientClipper,
    injector: NoiseInjector,
    sum: ClippedSum,
    clipped: usize,
    noise: NoiseSource,
}

impl DpSgdAggregator {
    /// Create an aggregator for gradients with structure `spec`.
    pub fn new(
        spec: ShapeSpec,
        max_grad_norm: f64,
        noise_multiplier: f64,
        noise: NoiseSource,
    ) -> Result<Self> {
        Ok(Self {
            clipper: GradientClipper::new(max_grad_norm)?,
            injector: NoiseInjector::new(noise_multiplier, max_grad_norm)?,
            sum: ClippedSum::new(spec),
            clipped: 0,
            noise,
        })
    }

    /// The clipper in use.
    pub fn clipper(&self) -> &GradientClipper {
        &self.clipper
    }

    /// The noise injector in use.
    pub fn injector(&self) -> &NoiseInjector {
        &self.injector
    }

    /// Examples accumulated for the current logical batch.
    pub fn pending(&self) -> usize {
        self.sum.count()
    }

    /// Clip and add one physical batch of per-example gradients.
    ///
    /// On error the whole logical step is abandoned: the running sum is
    /// cleared so a later call starts a fresh logical batch.
    pub fn accumulate(&mut self, per_example: &[Gradient]) -> Result<Vec<f64>> {
        match self.clipper.clip_and_accumulate(per_example, &mut self.sum) {
            Ok(norms) => {
                let c = self.clipper.max_grad_norm();
                self.clipped += norms.iter().filter(|&&n| n > c).count();
                Ok(norms)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Average the accumulated sum over `logical_batch_size` and add noise.
    ///
    /// `examples` is how many examples the logical batch was drawn with; it
    /// equals `logical_batch_size` for fixed-size batches and varies around
    /// it under Poisson sampling. Fails with [`DpError::InvalidState`] if the
    /// accumulated count differs from `examples`.
    pub fn finish(
        &mut self,
        examples: usize,
        logical_batch_size: usize,
    ) -> Result<(Gradient, AggregateStats)> {
        let count = self.sum.count();
        if count != examples {
            self.abort();
            return Err(DpError::state(format!(
                "logical batch closed with {count} examples, expected {examples}"
            )));
        }
        let (sum, examples) = self.sum.take();
        let clipped = std::mem::take(&mut self.clipped);
        let noised = self
            .injector
            .privatize(&sum, logical_batch_size, self.noise.rng())?;
        let stats = AggregateStats {
            examples,
            logical_batch_size,
            clipped_fraction: clipped as f64 / examples.max(1) as f64,
            noise_std: self.injector.std_for(logical_batch_size),
        };
        debug!(
            examples,
            clipped_fraction = stats.clipped_fraction,
            noise_std = stats.noise_std,
            "privatized logical batch"
        );
        Ok((noised, stats))
    }

    /// Drop everything accumulated for the current logical batch.
    pub fn abort(&mut self) {
        self.sum.reset();
        self.clipped = 0;
    }
}
