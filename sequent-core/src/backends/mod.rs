pub mod cpu;

use crate::error::Result;

use ndarray::{ArrayD, IxDyn, ScalarOperand};
use num_traits::{Float, FromPrimitive};
use rand::distributions::uniform::SampleUniform;

use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

/// Element type of every tensor in the library (`f32` or `f64`).
pub trait Scalar:
    Float
    + FromPrimitive
    + ScalarOperand
    + SampleUniform
    + Sum
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Debug
    + Display
    + Send
    + Sync
    + 'static
{
    fn from_f64_lossy(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }

    fn from_usize_lossy(value: usize) -> Self {
        Self::from_usize(value).unwrap_or_else(Self::nan)
    }
}

impl<T> Scalar for T where
    T: Float
        + FromPrimitive
        + ScalarOperand
        + SampleUniform
        + Sum
        + AddAssign
        + SubAssign
        + MulAssign
        + DivAssign
        + Debug
        + Display
        + Send
        + Sync
        + 'static
{
}

/// Dense N-dimensional array backend used by layers, losses and optimizers.
///
/// Binary operations broadcast `other` onto the shape of `self`; shapes that
/// cannot be broadcast that way are reported as a shape mismatch.
pub trait Tensor<T: Scalar>: Clone + Debug + Send + Sync + Sized {
    fn new(data: ArrayD<T>) -> Self;
    fn from_shape_vec(shape: &[usize], values: Vec<T>) -> Result<Self>;

    fn get_data(&self) -> &ArrayD<T>;
    fn get_data_mut(&mut self) -> &mut ArrayD<T>;
    fn into_data(self) -> ArrayD<T>;

    fn zeros(shape: &[usize]) -> Self;
    fn zeros_like(tensor: &Self) -> Self;
    fn ones(shape: &[usize]) -> Self;
    fn full(shape: &[usize], value: T) -> Self;
    fn random(shape: &[usize]) -> Self;

    fn shape(&self) -> Vec<usize>;
    fn ndim(&self) -> usize;
    fn size(&self) -> usize;
    fn raw_dim(&self) -> IxDyn;

    fn reshape(&self, shape: &[usize]) -> Result<Self>;
    fn transpose(&self) -> Self;
    fn permute(&self, axes: &[usize]) -> Result<Self>;
    fn reverse_axis(&self, axis: usize) -> Self;

    fn matmul(&self, other: &Self) -> Result<Self>;

    fn add(&self, other: &Self) -> Result<Self>;
    fn sub(&self, other: &Self) -> Result<Self>;
    fn mul(&self, other: &Self) -> Result<Self>;
    fn div(&self, other: &Self) -> Result<Self>;

    fn add_scalar(&self, scalar: T) -> Self;
    fn sub_scalar(&self, scalar: T) -> Self;
    fn mul_scalar(&self, scalar: T) -> Self;
    fn div_scalar(&self, scalar: T) -> Self;

    fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync;
    fn zip_map<F>(&self, other: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Send + Sync;

    /// Elementwise `if condition > 0 { on_true } else { on_false }`.
    fn select(condition: &Self, on_true: &Self, on_false: &Self) -> Result<Self>;
    /// 1 where the element is `>= threshold`, 0 elsewhere.
    fn greater_equal(&self, threshold: T) -> Self;

    fn sum(&self) -> T;
    fn mean(&self) -> T;
    fn norm(&self) -> T;
    fn sum_axis(&self, axis: usize) -> Self;
    fn mean_axis(&self, axis: usize) -> Self;
    fn is_finite(&self) -> bool;

    fn slice(&self, axis: usize, start: usize, end: usize) -> Self;
    fn index_axis_move(&self, axis: usize, index: usize) -> Self;
    fn concatenate(tensors: &[&Self], axis: usize) -> Result<Self>;
    fn stack(tensors: &[&Self], axis: usize) -> Result<Self>;

    fn iter(&self) -> ndarray::iter::Iter<'_, T, IxDyn>;
    fn iter_mut(&mut self) -> ndarray::iter::IterMut<'_, T, IxDyn>;
}
