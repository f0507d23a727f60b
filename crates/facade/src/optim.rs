//! Plain (non-private) optimizers.
//!
//! These know nothing about privacy; [`DpOptimizer`](crate::engine::DpOptimizer)
//! wraps one and feeds it the noised gradient once per logical batch.

use serde::{Deserialize, Serialize};

use dp_train_core::{DpError, Gradient, ParamSet, Result, Scalar, ShapeSpec, Tensor};

/// A parameter-update rule.
pub trait Optimizer {
    /// Apply one update of `params` with `grad`.
    fn step(&mut self, params: &mut ParamSet, grad: &Gradient) -> Result<()>;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn step(&mut self, params: &mut ParamSet, grad: &Gradient) -> Result<()> {
        (**self).step(params, grad)
    }

    fn learning_rate(&self) -> f64 {
        (**self).learning_rate()
    }
}

fn check_structure(params: &ParamSet, grad: &Gradient) -> Result<ShapeSpec> {
    let spec = params.spec();
    if grad.spec() != spec {
        return Err(DpError::invalid(format!(
            "gradient structure {:?} does not match parameters {:?}",
            grad.spec().shapes(),
            spec.shapes()
        )));
    }
    Ok(spec)
}

fn zeros(spec: &ShapeSpec) -> Vec<Tensor> {
    Gradient::zeros(spec).into_leaves()
}

/// Stochastic gradient descent with optional heavy-ball momentum.
#[derive(Clone, Debug)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    velocity: Option<Vec<Tensor>>,
}

impl Sgd {
    /// Plain SGD.
    pub fn new(lr: f64) -> Result<Self> {
        Self::with_momentum(lr, 0.0)
    }

    /// SGD with momentum in `[0, 1)`.
    pub fn with_momentum(lr: f64, momentum: f64) -> Result<Self> {
        if !lr.is_finite() || lr <= 0.0 {
            return Err(DpError::invalid("learning rate must be positive"));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(DpError::invalid("momentum must lie in [0, 1)"));
        }
        Ok(Self {
            lr,
            momentum,
            velocity: None,
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut ParamSet, grad: &Gradient) -> Result<()> {
        let spec = check_structure(params, grad)?;
        let lr = self.lr as Scalar;
        if self.momentum == 0.0 {
            for (p, g) in params.tensors_mut().iter_mut().zip(grad.leaves()) {
                p.scaled_add(-lr, g);
            }
            return Ok(());
        }
        let mu = self.momentum as Scalar;
        let velocity = self.velocity.get_or_insert_with(|| zeros(&spec));
        for ((p, v), g) in params
            .tensors_mut()
            .iter_mut()
            .zip(velocity.iter_mut())
            .zip(grad.leaves())
        {
            v.mapv_inplace(|x| x * mu);
            *v += g;
            p.scaled_add(-lr, v);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }
}

/// RMSprop: divides the step by a running root-mean-square of gradients.
#[derive(Clone, Debug)]
pub struct RmsProp {
    lr: f64,
    alpha: f64,
    eps: f64,
    square_avg: Option<Vec<Tensor>>,
}

impl RmsProp {
    /// RMSprop with smoothing `alpha` and stabilizer `eps`.
    pub fn new(lr: f64, alpha: f64, eps: f64) -> Result<Self> {
        if !lr.is_finite() || lr <= 0.0 {
            return Err(DpError::invalid("learning rate must be positive"));
        }
        if !(0.0..1.0).contains(&alpha) {
            return Err(DpError::invalid("alpha must lie in [0, 1)"));
        }
        if !eps.is_finite() || eps <= 0.0 {
            return Err(DpError::invalid("eps must be positive"));
        }
        Ok(Self {
            lr,
            alpha,
            eps,
            square_avg: None,
        })
    }

    /// RMSprop with `alpha = 0.99` and `eps = 1e-8`.
    pub fn with_lr(lr: f64) -> Result<Self> {
        Self::new(lr, 0.99, 1e-8)
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self, params: &mut ParamSet, grad: &Gradient) -> Result<()> {
        let spec = check_structure(params, grad)?;
        let (lr, alpha, eps) = (self.lr as Scalar, self.alpha as Scalar, self.eps as Scalar);
        let square_avg = self.square_avg.get_or_insert_with(|| zeros(&spec));
        for ((p, s), g) in params
            .tensors_mut()
            .iter_mut()
            .zip(square_avg.iter_mut())
            .zip(grad.leaves())
        {
            s.zip_mut_with(g, |s, &g| *s = alpha * *s + (1.0 - alpha) * g * g);
            ndarray::Zip::from(p)
                .and(&*s)
                .and(g)
                .for_each(|p, &s, &g| *p -= lr * g / (s.sqrt() + eps));
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }
}

/// Serializable optimizer choice.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    /// [`Sgd`].
    Sgd {
        /// Learning rate.
        lr: f64,
        /// Momentum.
        #[serde(default)]
        momentum: f64,
    },
    /// [`RmsProp`].
    RmsProp {
        /// Learning rate.
        lr: f64,
        /// Smoothing constant.
        #[serde(default = "default_alpha")]
        alpha: f64,
        /// Denominator stabilizer.
        #[serde(default = "default_eps")]
        eps: f64,
    },
}

fn default_alpha() -> f64 {
    0.99
}

fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::RmsProp {
            lr: 1e-3,
            alpha: default_alpha(),
            eps: default_eps(),
        }
    }
}

impl OptimizerConfig {
    /// Build the configured optimizer.
    pub fn build(&self) -> Result<Box<dyn Optimizer>> {
        Ok(match *self {
            Self::Sgd { lr, momentum } => Box::new(Sgd::with_momentum(lr, momentum)?),
            Self::RmsProp { lr, alpha, eps } => Box::new(RmsProp::new(lr, alpha, eps)?),
        })
    }
}
