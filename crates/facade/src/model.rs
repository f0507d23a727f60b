//! Models exposing per-example gradients.

use ndarray::{Array1, Array2, ArrayView1, Axis, Ix1, Ix2};

use dp_train_core::{DpError, Gradient, ParamSet, Result, Scalar, Tensor};

use crate::data::Example;

/// Output of a per-example backward pass over one physical batch.
#[derive(Clone, Debug)]
pub struct PerExampleOutput {
    /// One gradient per example, mirroring the parameter set.
    pub gradients: Vec<Gradient>,
    /// Loss of each example.
    pub losses: Vec<f64>,
    /// How many examples the model classified correctly.
    pub correct: usize,
}

/// A differentiable model the privacy engine can train.
///
/// The engine never looks inside the model: it only needs the parameter set
/// and a gradient per example so it can clip each one independently.
pub trait DifferentiableModel {
    /// Trainable parameters.
    fn params(&self) -> &ParamSet;

    /// Mutable parameters, for the optimizer.
    fn params_mut(&mut self) -> &mut ParamSet;

    /// Per-example gradients and losses for a batch.
    ///
    /// Implementations that cannot hold the batch in memory must return
    /// [`DpError::Resource`] rather than process a smaller batch.
    fn per_example_gradients(&self, batch: &[Example]) -> Result<PerExampleOutput>;

    /// Predicted class for one input.
    fn predict(&self, features: ArrayView1<'_, Scalar>) -> Result<usize>;
}

/// Multinomial logistic regression with cross-entropy loss.
#[derive(Clone, Debug)]
pub struct SoftmaxClassifier {
    params: ParamSet,
    num_features: usize,
    num_classes: usize,
    max_batch: Option<usize>,
}

impl SoftmaxClassifier {
    /// Zero-initialized classifier.
    pub fn new(num_features: usize, num_classes: usize) -> Result<Self> {
        if num_features == 0 || num_classes < 2 {
            return Err(DpError::invalid(
                "classifier needs at least one feature and two classes",
            ));
        }
        let params = ParamSet::new()
            .with("weight", Array2::<Scalar>::zeros((num_features, num_classes)).into_dyn())
            .with("bias", Array1::<Scalar>::zeros(num_classes).into_dyn());
        Ok(Self {
            params,
            num_features,
            num_classes,
            max_batch: None,
        })
    }

    /// Refuse batches larger than `max_batch` with a resource error.
    pub fn with_memory_limit(mut self, max_batch: usize) -> Self {
        self.max_batch = Some(max_batch);
        self
    }

    /// Number of input features.
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn weight(&self) -> Result<ndarray::ArrayView2<'_, Scalar>> {
        self.params.tensors()[0]
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| DpError::state(format!("weight is not a matrix: {e}")))
    }

    fn bias(&self) -> Result<ndarray::ArrayView1<'_, Scalar>> {
        self.params.tensors()[1]
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| DpError::state(format!("bias is not a vector: {e}")))
    }

    /// Class probabilities for one input.
    pub fn probabilities(&self, features: ArrayView1<'_, Scalar>) -> Result<Array1<Scalar>> {
        if features.len() != self.num_features {
            return Err(DpError::invalid(format!(
                "expected {} features, got {}",
                self.num_features,
                features.len()
            )));
        }
        let logits = features.dot(&self.weight()?) + self.bias()?;
        Ok(softmax(&logits))
    }
}

fn softmax(logits: &Array1<Scalar>) -> Array1<Scalar> {
    let max = logits.fold(Scalar::NEG_INFINITY, |a, &b| a.max(b));
    let exp = logits.mapv(|v| (v - max).exp());
    let total = exp.sum();
    exp / total
}

impl DifferentiableModel for SoftmaxClassifier {
    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn per_example_gradients(&self, batch: &[Example]) -> Result<PerExampleOutput> {
        if let Some(limit) = self.max_batch {
            if batch.len() > limit {
                return Err(DpError::resource(format!(
                    "batch of {} examples exceeds memory for {limit}",
                    batch.len()
                )));
            }
        }
        let mut gradients = Vec::with_capacity(batch.len());
        let mut losses = Vec::with_capacity(batch.len());
        let mut correct = 0;
        for ex in batch {
            if ex.label >= self.num_classes {
                return Err(DpError::invalid(format!(
                    "label {} out of range for {} classes",
                    ex.label, self.num_classes
                )));
            }
            let probs = self.probabilities(ex.features.view())?;
            let p_true = probs[ex.label] as f64;
            losses.push(-p_true.max(f64::MIN_POSITIVE).ln());
            if argmax(probs.view()) == ex.label {
                correct += 1;
            }

            let mut delta = probs;
            delta[ex.label] -= 1.0;
            let x = ex.features.view().insert_axis(Axis(1));
            let d = delta.view().insert_axis(Axis(0));
            let grad_w: Tensor = x.dot(&d).into_dyn();
            let grad_b: Tensor = delta.into_dyn();
            gradients.push(Gradient::new(vec![grad_w, grad_b]));
        }
        Ok(PerExampleOutput {
            gradients,
            losses,
            correct,
        })
    }

    fn predict(&self, features: ArrayView1<'_, Scalar>) -> Result<usize> {
        Ok(argmax(self.probabilities(features)?.view()))
    }
}

fn argmax(v: ArrayView1<'_, Scalar>) -> usize {
    let mut best = 0;
    for (i, &x) in v.iter().enumerate() {
        if x > v[best] {
            best = i;
        }
    }
    best
}
