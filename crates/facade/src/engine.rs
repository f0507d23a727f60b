//! The privacy engine: wraps a model, an optimizer and a loader.
//!
//! [`PrivacyEngine::attach`] validates the run, calibrates σ and hands back
//! three wrappers. [`PrivateModel`] pins the parameter shapes,
//! [`DpOptimizer`] replaces the plain update with clip, accumulate, noise
//! and step, and [`VirtualBatchLoader`] yields memory-bounded physical
//! batches. The engine and its optimizer share one ledger, so the accountant
//! advances exactly once per applied logical step.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ndarray::ArrayView1;
use tracing::{debug, info};

use dp_train_accounting::{planned_steps, sample_rate, Accountant, AnyAccountant, PrivacyBudget};
use dp_train_core::{
    AggregateStats, DpError, DpSgdAggregator, Gradient, NoiseSource, ParamSet, PartialBatchPolicy,
    PhysicalBatchMeta, Result, Sampling, Scalar, ShapeSpec, VirtualBatchPlan,
};

use crate::config::EngineConfig;
use crate::data::{DataLoader, Example, IndexedDataset};
use crate::loader::VirtualBatchLoader;
use crate::model::{DifferentiableModel, PerExampleOutput};
use crate::optim::Optimizer;

/// Lifecycle of a privacy engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Created, not yet attached.
    Uninitialized,
    /// Attached and calibrated; no step applied yet.
    Calibrated,
    /// At least one logical step applied.
    Training,
    /// Training closed; no further steps accepted.
    Finalized,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Calibrated => "calibrated",
            Self::Training => "training",
            Self::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Ledger {
    accountant: AnyAccountant,
    state: EngineState,
}

type SharedLedger = Rc<RefCell<Ledger>>;

/// Orchestrates calibration, wrapping and privacy reporting for one run.
#[derive(Debug)]
pub struct PrivacyEngine {
    config: EngineConfig,
    ledger: Option<SharedLedger>,
    planned_steps: u64,
}

impl PrivacyEngine {
    /// Create an engine; the configuration is validated eagerly.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ledger: None,
            planned_steps: 0,
        })
    }

    /// The run configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.ledger
            .as_ref()
            .map_or(EngineState::Uninitialized, |l| l.borrow().state)
    }

    /// Logical steps the noise was calibrated for.
    pub fn planned_steps(&self) -> u64 {
        self.planned_steps
    }

    /// Noise multiplier in use, once attached.
    pub fn noise_multiplier(&self) -> Option<f64> {
        self.ledger
            .as_ref()
            .map(|l| l.borrow().accountant.noise_multiplier())
    }

    /// Sample rate `q = B / N`, once attached.
    pub fn sample_rate(&self) -> Option<f64> {
        self.ledger
            .as_ref()
            .map(|l| l.borrow().accountant.sample_rate())
    }

    /// Logical steps applied so far.
    pub fn steps(&self) -> u64 {
        self.ledger
            .as_ref()
            .map_or(0, |l| l.borrow().accountant.steps())
    }

    /// Attach, planning `epochs × logical batches per epoch` steps.
    ///
    /// Poisson sampling draws `ceil(N / B)` logical batches per epoch.
    pub fn attach<M, O, D>(
        &mut self,
        model: M,
        optimizer: O,
        loader: DataLoader<D>,
    ) -> Result<(PrivateModel<M>, DpOptimizer<O>, VirtualBatchLoader<D>)>
    where
        M: DifferentiableModel,
        O: Optimizer,
        D: IndexedDataset,
    {
        let policy = match self.config.sampling {
            Sampling::Poisson => PartialBatchPolicy::Shrink,
            Sampling::Shuffle => self.config.partial_batch,
        };
        let steps = planned_steps(
            loader.dataset_len(),
            loader.batch_size(),
            self.config.epochs,
            policy,
        )?;
        self.attach_with_steps(model, optimizer, loader, steps)
    }

    /// Attach with an explicit planned step count.
    pub fn attach_with_steps<M, O, D>(
        &mut self,
        model: M,
        optimizer: O,
        loader: DataLoader<D>,
        planned_steps: u64,
    ) -> Result<(PrivateModel<M>, DpOptimizer<O>, VirtualBatchLoader<D>)>
    where
        M: DifferentiableModel,
        O: Optimizer,
        D: IndexedDataset,
    {
        if self.ledger.is_some() {
            return Err(DpError::state(format!(
                "engine is already attached (state: {})",
                self.state()
            )));
        }
        if planned_steps == 0 {
            return Err(DpError::invalid("planned_steps must be positive"));
        }
        let budget = self.config.budget()?;
        let plan = VirtualBatchPlan::new(
            loader.batch_size(),
            self.config.max_physical_batch_size,
            self.config.partial_batch,
        )?
        .with_sampling(self.config.sampling);
        let q = sample_rate(loader.batch_size(), loader.dataset_len())?;
        let spec = model.params().spec();
        if spec.is_empty() {
            return Err(DpError::invalid("model has no parameters"));
        }

        let accountant = self.build_accountant(&budget, planned_steps, q)?;
        let sigma = accountant.noise_multiplier();
        let projected = accountant.epsilon_at(budget.target_delta, planned_steps)?;
        info!(
            sigma,
            sample_rate = q,
            sampling = ?self.config.sampling,
            planned_steps,
            accountant = accountant.mechanism(),
            projected_epsilon = projected,
            target_epsilon = budget.target_epsilon,
            target_delta = budget.target_delta,
            "privacy engine attached"
        );

        let mut noise = match self.config.seed {
            Some(seed) => NoiseSource::seeded(seed),
            None => NoiseSource::from_entropy(),
        };
        debug!(seed = ?noise.seed(), "random source ready");
        let sampler_source = noise.split()?;
        let virtual_loader = VirtualBatchLoader::new(loader, plan, sampler_source)?;
        let aggregator = DpSgdAggregator::new(spec.clone(), budget.max_grad_norm, sigma, noise)?;
        let ledger = Rc::new(RefCell::new(Ledger {
            accountant,
            state: EngineState::Calibrated,
        }));
        self.ledger = Some(Rc::clone(&ledger));
        self.planned_steps = planned_steps;

        Ok((
            PrivateModel { inner: model, spec },
            DpOptimizer {
                inner: optimizer,
                aggregator,
                ledger,
            },
            virtual_loader,
        ))
    }

    fn build_accountant(
        &self,
        budget: &PrivacyBudget,
        planned_steps: u64,
        q: f64,
    ) -> Result<AnyAccountant> {
        let kind = self.config.accountant;
        let options = self.config.calibration;
        match self.config.noise_multiplier {
            Some(sigma) => {
                let accountant = kind.build(sigma, q, options)?;
                let eps = accountant.epsilon_at(budget.target_delta, planned_steps)?;
                if eps > budget.target_epsilon {
                    return Err(DpError::invalid(format!(
                        "noise_multiplier {sigma} gives epsilon {eps:.4} over {planned_steps} \
                         steps, above target {}",
                        budget.target_epsilon
                    )));
                }
                Ok(accountant)
            }
            None => kind.calibrated(
                budget.target_epsilon,
                budget.target_delta,
                planned_steps,
                q,
                options,
            ),
        }
    }

    /// Epsilon spent so far at `delta`.
    ///
    /// Only meaningful once training has started.
    pub fn current_epsilon(&self, delta: f64) -> Result<f64> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| DpError::state("engine is not attached"))?;
        let ledger = ledger.borrow();
        match ledger.state {
            EngineState::Training | EngineState::Finalized => ledger.accountant.epsilon(delta),
            state => Err(DpError::state(format!(
                "epsilon is not available while {state}"
            ))),
        }
    }

    /// Epsilon spent so far at the configured target delta.
    pub fn spent_epsilon(&self) -> Result<f64> {
        self.current_epsilon(self.config.target_delta)
    }

    /// Close the run; the wrapped optimizer rejects further steps.
    pub fn finalize(&mut self) -> Result<f64> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| DpError::state("engine is not attached"))?;
        let mut ledger = ledger.borrow_mut();
        if ledger.state == EngineState::Finalized {
            return Err(DpError::state("engine is already finalized"));
        }
        ledger.state = EngineState::Finalized;
        let eps = ledger.accountant.epsilon(self.config.target_delta)?;
        info!(
            steps = ledger.accountant.steps(),
            epsilon = eps,
            delta = self.config.target_delta,
            "privacy engine finalized"
        );
        Ok(eps)
    }
}

/// A model whose parameter shapes are pinned for the run.
#[derive(Clone, Debug)]
pub struct PrivateModel<M> {
    inner: M,
    spec: ShapeSpec,
}

impl<M: DifferentiableModel> PrivateModel<M> {
    /// The wrapped model.
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Trainable parameters.
    pub fn params(&self) -> &ParamSet {
        self.inner.params()
    }

    /// Mutable parameters, for the optimizer.
    pub fn params_mut(&mut self) -> &mut ParamSet {
        self.inner.params_mut()
    }

    /// Per-example gradients for a physical batch.
    pub fn per_example_gradients(&self, batch: &[Example]) -> Result<PerExampleOutput> {
        let current = self.inner.params().spec();
        if current != self.spec {
            return Err(DpError::state(format!(
                "parameter shapes changed during training: {:?} -> {:?}",
                self.spec.shapes(),
                current.shapes()
            )));
        }
        self.inner.per_example_gradients(batch)
    }

    /// Predicted class for one input.
    pub fn predict(&self, features: ArrayView1<'_, Scalar>) -> Result<usize> {
        self.inner.predict(features)
    }
}

/// What a call to [`DpOptimizer::step`] did.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// The physical batch was clipped and accumulated; no update yet.
    Accumulated {
        /// Examples accumulated so far in this logical batch.
        pending: usize,
    },
    /// The logical batch closed: noise added, parameters updated, step recorded.
    Applied {
        /// Accountant step count after this update.
        step: u64,
        /// Aggregation summary.
        stats: AggregateStats,
    },
}

impl StepOutcome {
    /// Whether parameters were updated.
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Optimizer wrapper applying DP-SGD once per logical batch.
///
/// Holds a shared, single-threaded handle on the engine's ledger and is
/// therefore neither `Send` nor `Sync`.
#[derive(Debug)]
pub struct DpOptimizer<O> {
    inner: O,
    aggregator: DpSgdAggregator,
    ledger: SharedLedger,
}

impl<O: Optimizer> DpOptimizer<O> {
    /// The wrapped optimizer.
    pub fn inner(&self) -> &O {
        &self.inner
    }

    /// Examples accumulated for the open logical batch.
    pub fn pending(&self) -> usize {
        self.aggregator.pending()
    }

    /// Noise multiplier applied.
    pub fn noise_multiplier(&self) -> f64 {
        self.aggregator.injector().noise_multiplier()
    }

    /// Clipping threshold applied.
    pub fn max_grad_norm(&self) -> f64 {
        self.aggregator.clipper().max_grad_norm()
    }

    /// Feed one physical batch of per-example gradients.
    ///
    /// Gradients are clipped and accumulated. When `meta` closes its logical
    /// batch the sum is averaged over the logical size, noised once, handed
    /// to the wrapped optimizer, and the accountant records one step. Any
    /// error discards the open logical batch and leaves the accountant as
    /// it was.
    pub fn step(
        &mut self,
        params: &mut ParamSet,
        per_example: &[Gradient],
        meta: &PhysicalBatchMeta,
    ) -> Result<StepOutcome> {
        let state = self.ledger.borrow().state;
        if matches!(state, EngineState::Finalized | EngineState::Uninitialized) {
            self.aggregator.abort();
            return Err(DpError::state(format!("cannot step while {state}")));
        }
        if meta.physical_index == 0 && self.aggregator.pending() > 0 {
            self.aggregator.abort();
            return Err(DpError::state(
                "new logical batch started before the previous one closed",
            ));
        }

        self.aggregator.accumulate(per_example)?;
        if !meta.closes_logical() {
            return Ok(StepOutcome::Accumulated {
                pending: self.aggregator.pending(),
            });
        }

        let (noised, stats) = self.aggregator.finish(meta.examples, meta.logical_size)?;
        self.inner.step(params, &noised)?;

        let mut ledger = self.ledger.borrow_mut();
        ledger.accountant.record_step();
        ledger.state = EngineState::Training;
        let step = ledger.accountant.steps();
        debug!(
            step,
            logical_size = meta.logical_size,
            clipped_fraction = stats.clipped_fraction,
            "applied private step"
        );
        Ok(StepOutcome::Applied { step, stats })
    }

    /// Discard the open logical batch.
    pub fn zero_grad(&mut self) {
        self.aggregator.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SoftmaxClassifier;
    use crate::optim::Sgd;
    use ndarray::array;

    fn dataset(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| Example::new(array![(i % 7) as Scalar / 7.0, 1.0], i % 2))
            .collect()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            target_epsilon: 8.0,
            epochs: 2,
            max_physical_batch_size: 4,
            sampling: Sampling::Shuffle,
            seed: Some(1),
            ..EngineConfig::default()
        }
    }

    fn attach(
        cfg: EngineConfig,
    ) -> (
        PrivacyEngine,
        PrivateModel<SoftmaxClassifier>,
        DpOptimizer<Sgd>,
        VirtualBatchLoader<Vec<Example>>,
    ) {
        let mut engine = PrivacyEngine::new(cfg).expect("valid config");
        let model = SoftmaxClassifier::new(2, 2).expect("model");
        let loader = DataLoader::new(dataset(100), 10).expect("loader");
        let (m, o, l) = engine
            .attach(model, Sgd::new(0.1).expect("sgd"), loader)
            .expect("attach");
        (engine, m, o, l)
    }

    #[test]
    fn lifecycle_transitions() {
        let engine = PrivacyEngine::new(config()).expect("valid");
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.current_epsilon(1e-5).is_err());

        let (mut engine, mut model, mut opt, mut loader) = attach(config());
        assert_eq!(engine.state(), EngineState::Calibrated);
        assert_eq!(engine.planned_steps(), 20);
        assert!(engine.current_epsilon(1e-5).is_err());

        let batches: Vec<_> = loader.epoch().expect("epoch").collect();
        for batch in &batches[..3] {
            let out = model.per_example_gradients(&batch.items).expect("grads");
            opt.step(model.params_mut(), &out.gradients, &batch.meta)
                .expect("step");
        }
        assert_eq!(engine.state(), EngineState::Training);
        assert_eq!(engine.steps(), 1);
        assert!(engine.current_epsilon(1e-5).expect("training") > 0.0);

        let spent = engine.finalize().expect("finalize");
        assert_eq!(engine.state(), EngineState::Finalized);
        assert_eq!(engine.current_epsilon(1e-5).expect("finalized"), spent);
        let batch = &batches[3];
        let out = model.per_example_gradients(&batch.items).expect("grads");
        let err = opt
            .step(model.params_mut(), &out.gradients, &batch.meta)
            .expect_err("finalized");
        assert!(matches!(err, DpError::InvalidState { .. }));
        assert!(engine.finalize().is_err());
    }

    #[test]
    fn one_accountant_step_per_logical_batch() {
        let (engine, mut model, mut opt, mut loader) = attach(config());
        let mut applied = 0;
        for batch in loader.epoch().expect("epoch") {
            let out = model.per_example_gradients(&batch.items).expect("grads");
            if opt
                .step(model.params_mut(), &out.gradients, &batch.meta)
                .expect("step")
                .applied()
            {
                applied += 1;
            }
        }
        assert_eq!(applied, 10);
        assert_eq!(engine.steps(), 10);
    }

    #[test]
    fn poisson_batches_step_once_each() {
        let cfg = EngineConfig {
            sampling: Sampling::Poisson,
            ..config()
        };
        let (engine, mut model, mut opt, mut loader) = attach(cfg);
        assert_eq!(engine.planned_steps(), 20);
        let mut applied = 0;
        let mut drawn = 0;
        for batch in loader.epoch().expect("epoch") {
            let out = model.per_example_gradients(&batch.items).expect("grads");
            let outcome = opt
                .step(model.params_mut(), &out.gradients, &batch.meta)
                .expect("step");
            if let StepOutcome::Applied { stats, .. } = outcome {
                assert_eq!(stats.logical_batch_size, 10);
                drawn += stats.examples;
                applied += 1;
            }
        }
        assert_eq!(applied, 10);
        assert_eq!(engine.steps(), 10);
        assert!(drawn > 50 && drawn < 150, "drew {drawn} examples");
    }

    #[test]
    fn physical_cap_above_logical_batch_rejected() {
        let cfg = EngineConfig {
            max_physical_batch_size: 11,
            ..config()
        };
        let mut engine = PrivacyEngine::new(cfg).expect("valid");
        let loader = DataLoader::new(dataset(100), 10).expect("loader");
        let err = engine
            .attach(
                SoftmaxClassifier::new(2, 2).expect("model"),
                Sgd::new(0.1).expect("sgd"),
                loader,
            )
            .expect_err("P > B");
        assert!(err.is_validation());
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn explicit_sigma_over_budget_rejected() {
        let cfg = EngineConfig {
            noise_multiplier: Some(0.3),
            target_epsilon: 0.5,
            ..config()
        };
        let mut engine = PrivacyEngine::new(cfg).expect("valid");
        let loader = DataLoader::new(dataset(100), 10).expect("loader");
        assert!(engine
            .attach(
                SoftmaxClassifier::new(2, 2).expect("model"),
                Sgd::new(0.1).expect("sgd"),
                loader,
            )
            .is_err());
    }

    #[test]
    fn non_finite_gradient_aborts_without_accounting() {
        let (engine, mut model, mut opt, mut loader) = attach(config());
        let batches: Vec<_> = loader.epoch().expect("epoch").collect();
        let before = model.params().clone();

        let out = model.per_example_gradients(&batches[0].items).expect("grads");
        opt.step(model.params_mut(), &out.gradients, &batches[0].meta)
            .expect("first physical batch");
        assert_eq!(opt.pending(), 4);

        let mut bad = model.per_example_gradients(&batches[1].items).expect("grads");
        bad.gradients[0].leaves_mut()[0][[0, 0]] = Scalar::NAN;
        let err = opt
            .step(model.params_mut(), &bad.gradients, &batches[1].meta)
            .expect_err("nan");
        assert!(matches!(err, DpError::Numerical { .. }));
        assert_eq!(opt.pending(), 0);
        assert_eq!(engine.steps(), 0);
        assert_eq!(model.params(), &before);
    }

    #[test]
    fn shape_drift_detected() {
        let (_engine, mut model, _opt, _loader) = attach(config());
        model.params_mut().tensors_mut()[1] = ndarray::Array1::<Scalar>::zeros(3).into_dyn();
        let err = model
            .per_example_gradients(&dataset(1))
            .expect_err("bias resized");
        assert!(matches!(err, DpError::InvalidState { .. }));
    }

    #[test]
    fn second_attach_rejected() {
        let (mut engine, ..) = attach(config());
        let loader = DataLoader::new(dataset(100), 10).expect("loader");
        let err = engine
            .attach(
                SoftmaxClassifier::new(2, 2).expect("model"),
                Sgd::new(0.1).expect("sgd"),
                loader,
            )
            .expect_err("already attached");
        assert!(matches!(err, DpError::InvalidState { .. }));
    }
}
