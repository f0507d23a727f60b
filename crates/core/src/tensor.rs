//! Scalar and tensor aliases plus the norms clipping is built on.

use ndarray::ArrayD;

/// Element type of parameters and gradients.
#[cfg(not(feature = "f32"))]
pub type Scalar = f64;

/// Element type of parameters and gradients.
#[cfg(feature = "f32")]
pub type Scalar = f32;

/// One parameter or gradient leaf, of any rank.
pub type Tensor = ArrayD<Scalar>;

/// Sum of squared entries, accumulated in f64.
///
/// NaN anywhere gives NaN; otherwise an infinite entry gives infinity.
pub fn squared_norm(t: &Tensor) -> f64 {
    let mut saw_inf = false;
    let mut acc = 0.0f64;
    for &v in t {
        let v = f64::from(v);
        if v.is_nan() {
            return f64::NAN;
        }
        saw_inf |= v.is_infinite();
        acc += v * v;
    }
    if saw_inf {
        f64::INFINITY
    } else {
        acc
    }
}

/// L2 norm of one leaf.
pub fn l2_norm(t: &Tensor) -> f64 {
    squared_norm(t).sqrt()
}

/// Position (in logical iteration order) of the first non-finite entry.
pub fn first_non_finite(t: &Tensor) -> Option<usize> {
    t.iter().position(|v| !v.is_finite())
}
