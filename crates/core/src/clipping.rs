//! Per-example gradient clipping for bounded sensitivity.
//!
//! Clipping is global: the scale factor for one example is computed from the
//! L2 norm of the concatenation of all of its parameter gradients. Clipping
//! each tensor independently would let an example contribute up to
//! `C * sqrt(num_tensors)`, breaking the sensitivity the accountant assumes.

use tracing::trace;

use crate::error::{DpError, Result};
use crate::params::{Gradient, ShapeSpec};

/// Result of a clipping operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipReport {
    /// Original L2 norm before clipping.
    pub original_norm: f64,
    /// Whether clipping was applied.
    pub clipped: bool,
    /// Scale factor applied (1.0 if not clipped).
    pub scale: f64,
}

/// Clip a gradient in place to a maximum global L2 norm.
///
/// Fails with [`DpError::Numerical`] if the gradient holds NaN or infinite
/// values; the gradient is left untouched in that case.
pub fn clip_gradient(grad: &mut Gradient, max_norm: f64) -> Result<ClipReport> {
    if !max_norm.is_finite() || max_norm <= 0.0 {
        return Err(DpError::invalid(format!(
            "max_grad_norm must be positive and finite, got {max_norm}"
        )));
    }
    if let Some((leaf, offset)) = grad.first_non_finite() {
        return Err(DpError::numerical(format!(
            "non-finite gradient value in parameter {leaf} at offset {offset}"
        )));
    }

    let norm = grad.global_l2_norm();
    if norm <= max_norm {
        return Ok(ClipReport {
            original_norm: norm,
            clipped: false,
            scale: 1.0,
        });
    }

    let scale = max_norm / norm;
    grad.scale(scale);
    Ok(ClipReport {
        original_norm: norm,
        clipped: true,
        scale,
    })
}

/// Per-example clipper with a fixed threshold `C`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradientClipper {
    max_grad_norm: f64,
}

impl GradientClipper {
    /// Create a clipper; `max_grad_norm` must be positive and finite.
    pub fn new(max_grad_norm: f64) -> Result<Self> {
        if !max_grad_norm.is_finite() || max_grad_norm <= 0.0 {
            return Err(DpError::invalid(format!(
                "max_grad_norm must be positive and finite, got {max_grad_norm}"
            )));
        }
        Ok(Self { max_grad_norm })
    }

    /// The clipping threshold `C`.
    pub fn max_grad_norm(&self) -> f64 {
        self.max_grad_norm
    }

    /// Return a clipped copy of `grad` and a report.
    pub fn clip(&self, grad: &Gradient) -> Result<(Gradient, ClipReport)> {
        let mut out = grad.clone();
        let report = clip_gradient(&mut out, self.max_grad_norm)?;
        Ok((out, report))
    }

    /// Clip every example of a physical batch and add them into `sum`.
    ///
    /// All examples are validated and clipped before any is added, so an
    /// error leaves `sum` exactly as it was. Returns pre-clip norms.
    pub fn clip_and_accumulate(
        &self,
        examples: &[Gradient],
        sum: &mut ClippedSum,
    ) -> Result<Vec<f64>> {
        let mut clipped = Vec::with_capacity(examples.len());
        let mut norms = Vec::with_capacity(examples.len());
        for (i, ex) in examples.iter().enumerate() {
            let spec = ex.spec();
            if &spec != sum.spec() {
                return Err(DpError::invalid(format!(
                    "example {i} gradient structure {:?} does not match parameters {:?}",
                    spec.shapes(),
                    sum.spec().shapes()
                )));
            }
            let (c, report) = self.clip(ex).map_err(|e| match e {
                DpError::Numerical { msg } => DpError::numerical(format!("example {i}: {msg}")),
                other => other,
            })?;
            norms.push(report.original_norm);
            clipped.push(c);
        }

        for c in &clipped {
            sum.add(c)?;
        }
        trace!(
            examples = examples.len(),
            total = sum.count(),
            "accumulated clipped gradients"
        );
        Ok(norms)
    }
}

/// Running sum of clipped per-example gradients for one logical batch.
#[derive(Clone, Debug)]
pub struct ClippedSum {
    spec: ShapeSpec,
    sum: Gradient,
    count: usize,
}

impl ClippedSum {
    /// Empty sum for gradients with the given structure.
    pub fn new(spec: ShapeSpec) -> Self {
        let sum = Gradient::zeros(&spec);
        Self {
            spec,
            sum,
            count: 0,
        }
    }

    /// Structure of the accumulated gradients.
    pub fn spec(&self) -> &ShapeSpec {
        &self.spec
    }

    /// Number of examples accumulated so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The current sum.
    pub fn sum(&self) -> &Gradient {
        &self.sum
    }

    /// Add one already-clipped example.
    pub fn add(&mut self, clipped: &Gradient) -> Result<()> {
        self.sum.add_assign(clipped)?;
        self.count += 1;
        Ok(())
    }

    /// Discard everything accumulated so far.
    pub fn reset(&mut self) {
        self.sum = Gradient::zeros(&self.spec);
        self.count = 0;
    }

    /// Take the sum and count, leaving the accumulator empty.
    pub fn take(&mut self) -> (Gradient, usize) {
        let sum = std::mem::replace(&mut self.sum, Gradient::zeros(&self.spec));
        let count = std::mem::take(&mut self.count);
        (sum, count)
    }
}
