//! Core differentially private training primitives.
//!
//! This crate provides the model-agnostic building blocks of DP-SGD:
//! parameter and gradient containers, per-example clipping, Gaussian noise,
//! logical-step aggregation, Poisson batch sampling and virtual batch splitting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod clipping;
pub mod error;
pub mod noise;
pub mod params;
pub mod sampling;
pub mod splitting;
pub mod tensor;

pub use aggregator::{AggregateStats, DpSgdAggregator};
pub use clipping::{clip_gradient, ClipReport, ClippedSum, GradientClipper};
pub use error::{DpError, Result};
pub use noise::{add_gaussian_noise, NoiseInjector, NoiseSource};
pub use params::{Gradient, ParamSet, ShapeSpec};
pub use sampling::{poisson_sample, PoissonSampler, Sampling};
pub use splitting::{
    logical_batches_per_epoch, num_physical_batches, split_logical_batch, PartialBatchPolicy,
    PhysicalBatchMeta, VirtualBatchPlan,
};
pub use tensor::{l2_norm, squared_norm, Scalar, Tensor};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        add_gaussian_noise, clip_gradient, split_logical_batch, AggregateStats, ClipReport,
        ClippedSum, DpError, DpSgdAggregator, Gradient, GradientClipper, NoiseInjector,
        NoiseSource, ParamSet, PartialBatchPolicy, PoissonSampler, Result, Sampling, Scalar,
        ShapeSpec, Tensor, VirtualBatchPlan,
    };
}
