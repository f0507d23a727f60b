//! Epoch-level training and evaluation loops.

use tracing::info;

use dp_train_core::{DpError, Result};

use crate::data::{Example, IndexedDataset};
use crate::engine::{DpOptimizer, PrivacyEngine, PrivateModel, StepOutcome};
use crate::loader::VirtualBatchLoader;
use crate::model::DifferentiableModel;
use crate::optim::Optimizer;

/// Summary of one training epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochMetrics {
    /// Zero-based epoch number.
    pub epoch: usize,
    /// Mean per-example loss over the epoch.
    pub mean_loss: f64,
    /// Training accuracy over the epoch, before each update.
    pub accuracy: f64,
    /// Logical steps applied during the epoch.
    pub steps: u64,
    /// Epsilon spent at the end of the epoch, at the target delta.
    pub epsilon: f64,
}

/// Run one epoch of private training.
///
/// Any error aborts the open logical batch and is returned unchanged; steps
/// already applied stay recorded.
pub fn train_epoch<M, O, D>(
    engine: &PrivacyEngine,
    model: &mut PrivateModel<M>,
    optimizer: &mut DpOptimizer<O>,
    loader: &mut VirtualBatchLoader<D>,
    epoch: usize,
) -> Result<EpochMetrics>
where
    M: DifferentiableModel,
    O: Optimizer,
    D: IndexedDataset<Item = Example>,
{
    let report_every = engine.config().report_every;
    let mut loss_sum = 0.0;
    let mut seen = 0usize;
    let mut correct = 0usize;
    let mut steps = 0u64;

    for batch in loader.epoch()? {
        let outcome = match model.per_example_gradients(&batch.items) {
            Ok(out) => {
                loss_sum += out.losses.iter().sum::<f64>();
                seen += out.losses.len();
                correct += out.correct;
                optimizer.step(model.params_mut(), &out.gradients, &batch.meta)
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(StepOutcome::Applied { step, .. }) => {
                steps += 1;
                if step % report_every == 0 {
                    info!(
                        epoch,
                        step,
                        epsilon = engine.spent_epsilon()?,
                        delta = engine.config().target_delta,
                        "privacy spent"
                    );
                }
            }
            Ok(StepOutcome::Accumulated { .. }) => {}
            Err(e) => {
                optimizer.zero_grad();
                return Err(e);
            }
        }
    }

    let epsilon = if steps > 0 || engine.steps() > 0 {
        engine.spent_epsilon()?
    } else {
        0.0
    };
    let metrics = EpochMetrics {
        epoch,
        mean_loss: loss_sum / seen.max(1) as f64,
        accuracy: correct as f64 / seen.max(1) as f64,
        steps,
        epsilon,
    };
    info!(
        epoch,
        loss = metrics.mean_loss,
        accuracy = metrics.accuracy,
        epsilon,
        "epoch finished"
    );
    Ok(metrics)
}

/// Classification accuracy of `model` on `examples`.
pub fn evaluate<M: DifferentiableModel>(
    model: &PrivateModel<M>,
    examples: &[Example],
) -> Result<f64> {
    if examples.is_empty() {
        return Err(DpError::invalid("evaluation set must not be empty"));
    }
    let mut correct = 0usize;
    for ex in examples {
        if model.predict(ex.features.view())? == ex.label {
            correct += 1;
        }
    }
    Ok(correct as f64 / examples.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::data::DataLoader;
    use crate::model::SoftmaxClassifier;
    use crate::optim::Sgd;
    use dp_train_core::{Sampling, Scalar};
    use ndarray::array;

    fn separable(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| {
                let label = i % 2;
                let sign = if label == 0 { -1.0 } else { 1.0 };
                let jitter = (i % 5) as Scalar * 0.05;
                Example::new(array![sign * (1.0 + jitter), 0.5], label)
            })
            .collect()
    }

    #[test]
    fn epoch_reports_steps_and_epsilon() {
        let cfg = EngineConfig {
            target_epsilon: 8.0,
            epochs: 3,
            max_physical_batch_size: 8,
            seed: Some(5),
            report_every: 4,
            ..EngineConfig::default()
        };
        let mut engine = PrivacyEngine::new(cfg).expect("valid");
        let loader = DataLoader::new(separable(200), 20).expect("loader").shuffled(2);
        let (mut model, mut opt, mut loader) = engine
            .attach(
                SoftmaxClassifier::new(2, 2).expect("model"),
                Sgd::new(0.5).expect("sgd"),
                loader,
            )
            .expect("attach");

        let first = train_epoch(&engine, &mut model, &mut opt, &mut loader, 0).expect("epoch 0");
        assert_eq!(first.steps, 10);
        assert!(first.epsilon > 0.0);
        assert_eq!(first.epsilon, engine.spent_epsilon().expect("training"));
        let second = train_epoch(&engine, &mut model, &mut opt, &mut loader, 1).expect("epoch 1");
        assert!(second.epsilon > first.epsilon);
        assert_eq!(engine.steps(), 20);

        let acc = evaluate(&model, &separable(50)).expect("non-empty");
        assert!((0.0..=1.0).contains(&acc));
    }

    #[test]
    fn loss_falls_on_separable_data() {
        let cfg = EngineConfig {
            target_epsilon: 8.0,
            epochs: 5,
            max_physical_batch_size: 25,
            seed: Some(13),
            ..EngineConfig::default()
        };
        let mut engine = PrivacyEngine::new(cfg).expect("valid");
        let loader = DataLoader::new(separable(400), 50).expect("loader").shuffled(4);
        let (mut model, mut opt, mut loader) = engine
            .attach(
                SoftmaxClassifier::new(2, 2).expect("model"),
                Sgd::new(0.5).expect("sgd"),
                loader,
            )
            .expect("attach");
        assert_eq!(engine.sample_rate(), Some(0.125));

        let first = train_epoch(&engine, &mut model, &mut opt, &mut loader, 0).expect("epoch");
        let mut last = first.clone();
        for epoch in 1..5 {
            last = train_epoch(&engine, &mut model, &mut opt, &mut loader, epoch).expect("epoch");
        }
        assert!(last.mean_loss < first.mean_loss, "{} !< {}", last.mean_loss, first.mean_loss);
        assert!(evaluate(&model, &separable(100)).expect("non-empty") > 0.9);
    }

    #[test]
    fn resource_error_aborts_without_step() {
        let cfg = EngineConfig {
            target_epsilon: 8.0,
            epochs: 1,
            max_physical_batch_size: 10,
            sampling: Sampling::Shuffle,
            seed: Some(5),
            ..EngineConfig::default()
        };
        let mut engine = PrivacyEngine::new(cfg).expect("valid");
        let loader = DataLoader::new(separable(100), 20).expect("loader");
        let (mut model, mut opt, mut loader) = engine
            .attach(
                SoftmaxClassifier::new(2, 2).expect("model").with_memory_limit(5),
                Sgd::new(0.5).expect("sgd"),
                loader,
            )
            .expect("attach");

        let err = train_epoch(&engine, &mut model, &mut opt, &mut loader, 0).expect_err("oom");
        assert!(matches!(err, DpError::Resource { .. }));
        assert_eq!(engine.steps(), 0);
        assert_eq!(opt.pending(), 0);
    }

    #[test]
    fn empty_evaluation_rejected() {
        let mut engine = PrivacyEngine::new(EngineConfig {
            max_physical_batch_size: 2,
            ..EngineConfig::default()
        })
        .expect("valid");
        let loader = DataLoader::new(separable(10), 2).expect("loader");
        let (model, _, _) = engine
            .attach_with_steps(
                SoftmaxClassifier::new(2, 2).expect("model"),
                Sgd::new(0.1).expect("sgd"),
                loader,
                5,
            )
            .expect("attach");
        assert!(evaluate(&model, &[]).is_err());
    }
}
