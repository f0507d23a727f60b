//! Parameter sets and per-example gradients.
//!
//! A model's trainable state is an ordered list of named tensors whose shapes
//! are fixed for the duration of a run. Gradients mirror that list entry by
//! entry, so every operation of the mechanism works on flat leaf vectors and
//! a [`ShapeSpec`] describing them.

use ndarray::IxDyn;
use serde::{Deserialize, Serialize};

use crate::error::{DpError, Result};
use crate::tensor::{first_non_finite, squared_norm, Scalar, Tensor};

/// Structural description of a parameter or gradient set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeSpec {
    shapes: Vec<Vec<usize>>,
}

impl ShapeSpec {
    /// Describe a slice of tensors.
    pub fn of(tensors: &[Tensor]) -> Self {
        Self {
            shapes: tensors.iter().map(|t| t.shape().to_vec()).collect(),
        }
    }

    /// Shape of each entry, in order.
    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Whether no tensor shapes are recorded.
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Total number of scalar coordinates.
    pub fn num_elements(&self) -> usize {
        self.shapes
            .iter()
            .map(|s| s.iter().product::<usize>())
            .sum()
    }
}

/// Ordered, named collection of model parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamSet {
    names: Vec<String>,
    tensors: Vec<Tensor>,
}

impl ParamSet {
    /// Create an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named tensor, builder style.
    pub fn with<S: Into<String>>(mut self, name: S, tensor: Tensor) -> Self {
        self.push(name, tensor);
        self
    }

    /// Append a named tensor.
    pub fn push<S: Into<String>>(&mut self, name: S, tensor: Tensor) {
        self.names.push(name.into());
        self.tensors.push(tensor);
    }

    /// Number of parameter tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the set holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Parameter names, in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Parameter tensors, in order.
    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// Mutable access to the parameter tensors.
    ///
    /// Callers may change values but must not change shapes.
    pub fn tensors_mut(&mut self) -> &mut [Tensor] {
        &mut self.tensors
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.tensors[i])
    }

    /// Iterate over `(name, tensor)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.tensors.iter())
    }

    /// Shape description of this set.
    pub fn spec(&self) -> ShapeSpec {
        ShapeSpec::of(&self.tensors)
    }

    /// Total number of scalar parameters.
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }
}

/// A gradient with one leaf per parameter tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Gradient {
    leaves: Vec<Tensor>,
}

impl Gradient {
    /// Wrap leaf tensors as a gradient.
    pub fn new(leaves: Vec<Tensor>) -> Self {
        Self { leaves }
    }

    /// All-zero gradient with the given structure.
    pub fn zeros(spec: &ShapeSpec) -> Self {
        let leaves = spec
            .shapes()
            .iter()
            .map(|s| Tensor::zeros(IxDyn(s)))
            .collect();
        Self { leaves }
    }

    /// Leaf tensors, in parameter order.
    pub fn leaves(&self) -> &[Tensor] {
        &self.leaves
    }

    /// Mutable leaf tensors.
    pub fn leaves_mut(&mut self) -> &mut [Tensor] {
        &mut self.leaves
    }

    /// Consume into leaf tensors.
    pub fn into_leaves(self) -> Vec<Tensor> {
        self.leaves
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Whether the gradient has no leaves.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Shape description of this gradient.
    pub fn spec(&self) -> ShapeSpec {
        ShapeSpec::of(&self.leaves)
    }

    /// L2 norm over the concatenation of all leaves.
    ///
    /// NaN or infinity propagate to the result.
    pub fn global_l2_norm(&self) -> f64 {
        let mut sum_sq = 0.0_f64;
        for leaf in &self.leaves {
            let sq = squared_norm(leaf);
            if !sq.is_finite() {
                return sq;
            }
            sum_sq += sq;
        }
        sum_sq.sqrt()
    }

    /// Locate the first non-finite coordinate as `(leaf, offset)`.
    pub fn first_non_finite(&self) -> Option<(usize, usize)> {
        self.leaves
            .iter()
            .enumerate()
            .find_map(|(i, leaf)| first_non_finite(leaf).map(|j| (i, j)))
    }

    /// Multiply every coordinate by `factor`.
    pub fn scale(&mut self, factor: f64) {
        let f = factor as Scalar;
        for leaf in &mut self.leaves {
            leaf.mapv_inplace(|v| v * f);
        }
    }

    /// Return a copy with every coordinate multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        let mut out = self.clone();
        out.scale(factor);
        out
    }

    /// Add another gradient of identical structure into this one.
    pub fn add_assign(&mut self, other: &Gradient) -> Result<()> {
        if self.leaves.len() != other.leaves.len() {
            return Err(DpError::invalid(format!(
                "gradient has {} leaves, expected {}",
                other.leaves.len(),
                self.leaves.len()
            )));
        }
        for (i, (acc, leaf)) in self.leaves.iter_mut().zip(&other.leaves).enumerate() {
            if acc.shape() != leaf.shape() {
                return Err(DpError::invalid(format!(
                    "gradient leaf {i} has shape {:?}, expected {:?}",
                    leaf.shape(),
                    acc.shape()
                )));
            }
            *acc += leaf;
        }
        Ok(())
    }
}

impl From<Vec<Tensor>> for Gradient {
    fn from(leaves: Vec<Tensor>) -> Self {
        Self::new(leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_global_norm_spans_leaves() {
        let g = Gradient::new(vec![array![3.0].into_dyn(), array![4.0].into_dyn()]);
        assert!((g.global_l2_norm() - 5.0).abs() < 1e-10);
    }

    #[test]
    fn param_set_lookup_and_spec() {
        let params = ParamSet::new()
            .with("w", Tensor::zeros(IxDyn(&[3, 2])))
            .with("b", Tensor::zeros(IxDyn(&[2])));
        assert_eq!(params.len(), 2);
        assert_eq!(params.num_elements(), 8);
        assert_eq!(params.get("b").map(|t| t.len()), Some(2));
        assert!(params.get("missing").is_none());
        let spec = params.spec();
        assert_eq!(spec.shapes(), &[vec![3, 2], vec![2]]);
        assert_eq!(Gradient::zeros(&spec).spec(), spec);
    }

    #[test]
    fn add_assign_rejects_shape_mismatch() {
        let mut a = Gradient::new(vec![array![1.0, 2.0].into_dyn()]);
        let b = Gradient::new(vec![array![1.0, 2.0, 3.0].into_dyn()]);
        assert!(a.add_assign(&b).is_err());
        let c = Gradient::new(vec![array![0.5, 0.5].into_dyn()]);
        a.add_assign(&c).expect("same shape");
        assert_eq!(a.leaves()[0], array![1.5, 2.5].into_dyn());
    }

    #[test]
    fn first_non_finite_reports_leaf() {
        let g = Gradient::new(vec![
            array![1.0, 2.0].into_dyn(),
            array![0.0, Scalar::NAN].into_dyn(),
        ]);
        assert_eq!(g.first_non_finite(), Some((1, 1)));
        assert!(g.global_l2_norm().is_nan());
    }
}
