//! Recurrent layers over `(batch, steps, features)` sequences.
//!
//! Each layer unrolls into one cached step record per timestep. Backward
//! runs full backpropagation through time across those records, with zero
//! initial state at step 0.

pub mod bidirectional;
pub mod gru;
pub mod lstm;

pub use bidirectional::{Bidirectional, MergeMode};
pub use gru::Gru;
pub use lstm::Lstm;

use super::{check_dim, check_rank, Layer};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::activations::sigmoid_scalar;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Ix1, Ix2, Ix3};

/// Capability of a layer that consumes a sequence step by step.
pub trait Recurrent<T: Scalar, B: Tensor<T>>: Layer<T, B> {
    fn units(&self) -> usize;

    /// `true`: output `(batch, steps, units)`; `false`: last state `(batch, units)`.
    fn return_sequences(&self) -> bool;

    /// A fresh layer with identical hyper-parameters and newly drawn weights.
    fn twin(&self) -> Self
    where
        Self: Sized;
}

pub(crate) fn sequence<'a, T: Scalar, B: Tensor<T>>(name: &str, input: &'a B, features: usize) -> Result<ArrayView3<'a, T>> {
    let shape = input.shape();
    check_rank(name, &shape, &[3])?;
    check_dim(name, &shape, 2, features)?;
    if shape[1] == 0 {
        return Err(NetError::invalid(format!("layer '{}' got an empty sequence", name)));
    }
    input
        .get_data()
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| NetError::invalid(e.to_string()))
}

pub(crate) fn matrix<'a, T: Scalar, B: Tensor<T>>(tensor: &'a B) -> Result<ArrayView2<'a, T>> {
    tensor
        .get_data()
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| NetError::invalid(e.to_string()))
}

pub(crate) fn vector<'a, T: Scalar, B: Tensor<T>>(tensor: &'a B) -> Result<ArrayView1<'a, T>> {
    tensor
        .get_data()
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| NetError::invalid(e.to_string()))
}

pub(crate) fn sigmoid<T: Scalar>(a: ArrayView2<T>) -> Array2<T> {
    a.mapv(sigmoid_scalar)
}

pub(crate) fn tanh<T: Scalar>(a: ArrayView2<T>) -> Array2<T> {
    a.mapv(|v| v.tanh())
}

/// Gradient with respect to the last-state or full-sequence output at step `t`.
pub(crate) fn output_gradient<T: Scalar>(
    gradient: &ndarray::ArrayViewD<T>,
    return_sequences: bool,
    t: usize,
    steps: usize,
) -> Option<Array2<T>> {
    if return_sequences {
        let step = gradient.index_axis(ndarray::Axis(1), t).to_owned();
        step.into_dimensionality::<Ix2>().ok()
    } else if t + 1 == steps {
        gradient.to_owned().into_dimensionality::<Ix2>().ok()
    } else {
        None
    }
}

pub(crate) fn output_shape(name: &str, input_shape: &[usize], features: usize, units: usize, return_sequences: bool) -> Result<Vec<usize>> {
    check_rank(name, input_shape, &[3])?;
    check_dim(name, input_shape, 2, features)?;
    Ok(if return_sequences {
        vec![input_shape[0], input_shape[1], units]
    } else {
        vec![input_shape[0], units]
    })
}

pub(crate) fn to_tensor<T: Scalar, B: Tensor<T>>(array: Array2<T>) -> B {
    B::new(array.into_dyn())
}

pub(crate) fn bias_tensor<T: Scalar, B: Tensor<T>>(array: Array1<T>) -> B {
    B::new(array.into_dyn())
}
