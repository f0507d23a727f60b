//! Train a softmax classifier on synthetic data with DP-SGD.
//!
//! Run with `RUST_LOG=info` (or `debug` for per-step detail).

use ndarray::Array1;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing_subscriber::EnvFilter;

use dp_train::core::Scalar;
use dp_train::prelude::*;

const FEATURES: usize = 16;
const CLASSES: usize = 4;

fn synthetic(n: usize, rng: &mut ChaCha8Rng) -> Vec<Example> {
    let noise = Normal::new(0.0, 0.8).expect("valid normal");
    let centers: Vec<Array1<Scalar>> = (0..CLASSES)
        .map(|_| Array1::from_shape_fn(FEATURES, |_| rng.gen_range(-1.0..1.0) as Scalar))
        .collect();
    (0..n)
        .map(|i| {
            let label = i % CLASSES;
            let features = centers[label].mapv(|c| c + noise.sample(rng) as Scalar);
            Example::new(features, label)
        })
        .collect()
}

fn main() -> dp_train::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let train = synthetic(10_000, &mut rng);
    let test = synthetic(2_000, &mut rng);

    let config = EngineConfig {
        target_epsilon: 5.0,
        target_delta: 1e-5,
        max_grad_norm: 1.2,
        epochs: 5,
        max_physical_batch_size: 128,
        report_every: 50,
        ..EngineConfig::default()
    };
    let epochs = config.epochs;
    let mut engine = PrivacyEngine::new(config)?;

    let loader = DataLoader::new(train, 200)?.shuffled(11);
    let (mut model, mut optimizer, mut loader) = engine.attach(
        SoftmaxClassifier::new(FEATURES, CLASSES)?,
        RmsProp::with_lr(1e-2)?,
        loader,
    )?;
    println!(
        "sigma = {:.4}, planned steps = {}",
        engine.noise_multiplier().unwrap_or_default(),
        engine.planned_steps()
    );

    for epoch in 0..epochs {
        let metrics = train_epoch(&engine, &mut model, &mut optimizer, &mut loader, epoch)?;
        println!(
            "epoch {epoch}: loss {:.4}, train acc {:.3}, eps {:.3}",
            metrics.mean_loss, metrics.accuracy, metrics.epsilon
        );
    }

    let spent = engine.finalize()?;
    let accuracy = evaluate(&model, &test)?;
    println!("test accuracy {accuracy:.3} at (eps = {spent:.3}, delta = 1e-5)");
    Ok(())
}
