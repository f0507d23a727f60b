//! Differentially private training with a privacy engine.
//!
//! [`PrivacyEngine::attach`] takes a model, an optimizer and a data loader,
//! calibrates the noise multiplier for the configured budget and returns
//! wrapped versions of all three. Training then proceeds as usual; each
//! logical batch is clipped per example, noised once and recorded by the
//! accountant.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod data;
pub mod engine;
pub mod loader;
pub mod model;
pub mod optim;
pub mod training;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use dp_train_accounting as accounting;
pub use dp_train_core as core;

pub use dp_train_accounting::{
    Accountant, AccountantKind, AnyAccountant, CalibrationOptions, GdpAccountant, PrivacyBudget,
    RdpAccountant,
};
pub use config::EngineConfig;
pub use dp_train_core::{DpError, PartialBatchPolicy, Result, Sampling};
pub use data::{DataLoader, Example, IndexedDataset};
pub use engine::{DpOptimizer, EngineState, PrivacyEngine, PrivateModel, StepOutcome};
pub use loader::{PhysicalBatch, VirtualBatchLoader, VirtualEpoch};
pub use model::{DifferentiableModel, PerExampleOutput, SoftmaxClassifier};
pub use optim::{Optimizer, OptimizerConfig, RmsProp, Sgd};
pub use training::{evaluate, train_epoch, EpochMetrics};

/// Convenience prelude for training loops.
pub mod prelude {
    pub use crate::accounting::prelude::*;
    pub use crate::core::prelude::*;
    pub use crate::{
        evaluate, train_epoch, DataLoader, DifferentiableModel, DpOptimizer, EngineConfig,
        EngineState, Example, IndexedDataset, Optimizer, PrivacyEngine, PrivateModel, RmsProp,
        Sgd, SoftmaxClassifier, StepOutcome, VirtualBatchLoader,
    };
}
