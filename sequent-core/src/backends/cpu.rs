use super::{Scalar, Tensor};
use crate::error::{NetError, Result};

use ndarray::{Array, ArrayD, ArrayView, ArrayViewD, Axis, Ix2, IxDyn, Zip};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Element count above which elementwise work is split across the current rayon pool.
pub const PARALLEL_THRESHOLD: usize = 1 << 14;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuTensor<T> {
    pub data: ArrayD<T>,
}

fn standard<T: Scalar>(data: ArrayD<T>) -> ArrayD<T> {
    if data.is_standard_layout() {
        data
    } else {
        data.as_standard_layout().into_owned()
    }
}

impl<T: Scalar> CpuTensor<T> {
    fn broadcast_view<'a>(&self, other: &'a Self, context: &str) -> Result<ArrayViewD<'a, T>> {
        other
            .data
            .broadcast(self.data.raw_dim())
            .ok_or_else(|| NetError::shape(context, self.data.shape(), other.data.shape()))
    }

    fn map_with<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync,
    {
        let mut data = self.data.clone();
        if data.len() >= PARALLEL_THRESHOLD {
            data.par_mapv_inplace(f);
        } else {
            data.mapv_inplace(f);
        }
        Self { data }
    }
}

impl<T: Scalar> Tensor<T> for CpuTensor<T> {
    fn new(data: ArrayD<T>) -> Self {
        Self { data }
    }

    fn from_shape_vec(shape: &[usize], values: Vec<T>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(NetError::invalid(format!(
                "cannot build a tensor of shape {:?} ({} elements) from {} values",
                shape,
                expected,
                values.len()
            )));
        }
        let data = Array::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| NetError::invalid(e.to_string()))?;
        Ok(Self { data })
    }

    fn get_data(&self) -> &ArrayD<T> {
        &self.data
    }

    fn get_data_mut(&mut self) -> &mut ArrayD<T> {
        &mut self.data
    }

    fn into_data(self) -> ArrayD<T> {
        self.data
    }

    fn zeros(shape: &[usize]) -> Self {
        Self { data: Array::zeros(IxDyn(shape)) }
    }

    fn zeros_like(tensor: &Self) -> Self {
        Self { data: Array::zeros(tensor.data.raw_dim()) }
    }

    fn ones(shape: &[usize]) -> Self {
        Self { data: Array::ones(IxDyn(shape)) }
    }

    fn full(shape: &[usize], value: T) -> Self {
        Self { data: Array::from_elem(IxDyn(shape), value) }
    }

    fn random(shape: &[usize]) -> Self {
        let mut rng = rand::thread_rng();
        let low = -T::one();
        let high = T::one();
        let data = Array::<T, IxDyn>::from_shape_fn(IxDyn(shape), |_| rng.gen_range(low..high));
        Self { data }
    }

    fn shape(&self) -> Vec<usize> {
        self.data.shape().to_vec()
    }

    fn ndim(&self) -> usize {
        self.data.ndim()
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn raw_dim(&self) -> IxDyn {
        self.data.raw_dim()
    }

    fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != self.data.len() {
            return Err(NetError::shape("reshape", shape, self.data.shape()));
        }
        let data = standard(self.data.clone())
            .into_shape(IxDyn(shape))
            .map_err(|_| NetError::shape("reshape", shape, self.data.shape()))?;
        Ok(Self { data })
    }

    fn transpose(&self) -> Self {
        Self { data: standard(self.data.clone().reversed_axes()) }
    }

    fn permute(&self, axes: &[usize]) -> Result<Self> {
        let ndim = self.data.ndim();
        let mut seen = vec![false; ndim];
        if axes.len() != ndim {
            return Err(NetError::invalid(format!(
                "permutation {:?} does not match a rank-{} tensor",
                axes, ndim
            )));
        }
        for &axis in axes {
            if axis >= ndim || seen[axis] {
                return Err(NetError::invalid(format!("invalid permutation {:?}", axes)));
            }
            seen[axis] = true;
        }
        Ok(Self { data: standard(self.data.clone().permuted_axes(IxDyn(axes))) })
    }

    fn reverse_axis(&self, axis: usize) -> Self {
        let mut view = self.data.view();
        view.invert_axis(Axis(axis));
        Self { data: view.as_standard_layout().into_owned() }
    }

    fn matmul(&self, other: &Self) -> Result<Self> {
        let first = self
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| NetError::invalid(format!("matmul expects rank 2, got {:?}", self.data.shape())))?;
        let second = other
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| NetError::invalid(format!("matmul expects rank 2, got {:?}", other.data.shape())))?;

        if first.ncols() != second.nrows() {
            return Err(NetError::shape(
                format!("right operand of matmul with a {:?} left operand", first.shape()),
                &[first.ncols(), second.ncols()],
                second.shape(),
            ));
        }

        Ok(Self { data: first.dot(&second).into_dyn() })
    }

    fn add(&self, other: &Self) -> Result<Self> {
        self.zip_map(other, |a, b| a + b)
    }

    fn sub(&self, other: &Self) -> Result<Self> {
        self.zip_map(other, |a, b| a - b)
    }

    fn mul(&self, other: &Self) -> Result<Self> {
        self.zip_map(other, |a, b| a * b)
    }

    fn div(&self, other: &Self) -> Result<Self> {
        self.zip_map(other, |a, b| a / b)
    }

    fn add_scalar(&self, scalar: T) -> Self {
        self.map_with(|x| x + scalar)
    }

    fn sub_scalar(&self, scalar: T) -> Self {
        self.map_with(|x| x - scalar)
    }

    fn mul_scalar(&self, scalar: T) -> Self {
        self.map_with(|x| x * scalar)
    }

    fn div_scalar(&self, scalar: T) -> Self {
        self.map_with(|x| x / scalar)
    }

    fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync,
    {
        self.map_with(f)
    }

    fn zip_map<F>(&self, other: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Send + Sync,
    {
        let rhs = self.broadcast_view(other, "elementwise operation")?;
        let mut data = self.data.clone();
        let zip = Zip::from(&mut data).and(rhs);
        if self.data.len() >= PARALLEL_THRESHOLD {
            zip.par_for_each(|a, &b| *a = f(*a, b));
        } else {
            zip.for_each(|a, &b| *a = f(*a, b));
        }
        Ok(Self { data })
    }

    fn select(condition: &Self, on_true: &Self, on_false: &Self) -> Result<Self> {
        let when_true = condition.broadcast_view(on_true, "select")?;
        let when_false = condition.broadcast_view(on_false, "select")?;
        let data = Zip::from(&condition.data)
            .and(when_true)
            .and(when_false)
            .map_collect(|&c, &t, &f| if c > T::zero() { t } else { f });
        Ok(Self { data })
    }

    fn greater_equal(&self, threshold: T) -> Self {
        self.map_with(|x| if x >= threshold { T::one() } else { T::zero() })
    }

    fn sum(&self) -> T {
        if self.data.len() >= PARALLEL_THRESHOLD {
            self.into_par_iter().map(|&x| x).sum()
        } else {
            self.data.iter().copied().sum()
        }
    }

    fn mean(&self) -> T {
        if self.data.is_empty() {
            return T::zero();
        }
        self.sum() / T::from_usize_lossy(self.data.len())
    }

    fn norm(&self) -> T {
        if self.data.len() >= PARALLEL_THRESHOLD {
            self.into_par_iter().map(|&x| x * x).sum::<T>().sqrt()
        } else {
            self.data.iter().map(|&x| x * x).sum::<T>().sqrt()
        }
    }

    fn sum_axis(&self, axis: usize) -> Self {
        Self { data: self.data.sum_axis(Axis(axis)) }
    }

    fn mean_axis(&self, axis: usize) -> Self {
        let len = self.data.len_of(Axis(axis));
        if len == 0 {
            return Self { data: self.data.sum_axis(Axis(axis)) };
        }
        Self { data: self.data.sum_axis(Axis(axis)) / T::from_usize_lossy(len) }
    }

    fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    fn slice(&self, axis: usize, start: usize, end: usize) -> Self {
        Self { data: self.data.slice_axis(Axis(axis), (start..end).into()).to_owned() }
    }

    fn index_axis_move(&self, axis: usize, index: usize) -> Self {
        Self { data: self.data.index_axis(Axis(axis), index).to_owned() }
    }

    fn concatenate(tensors: &[&Self], axis: usize) -> Result<Self> {
        let views = tensors.iter().map(|t| t.data.view()).collect::<Vec<ArrayViewD<T>>>();
        let data = ndarray::concatenate(Axis(axis), &views)
            .map_err(|e| NetError::invalid(format!("concatenate: {}", e)))?;
        Ok(Self { data })
    }

    fn stack(tensors: &[&Self], axis: usize) -> Result<Self> {
        let views = tensors.iter().map(|t| t.data.view()).collect::<Vec<ArrayViewD<T>>>();
        let data = ndarray::stack(Axis(axis), &views)
            .map_err(|e| NetError::invalid(format!("stack: {}", e)))?;
        Ok(Self { data })
    }

    fn iter(&self) -> ndarray::iter::Iter<'_, T, IxDyn> {
        self.data.iter()
    }

    fn iter_mut(&mut self) -> ndarray::iter::IterMut<'_, T, IxDyn> {
        self.data.iter_mut()
    }
}

impl<'a, T> IntoParallelIterator for &'a CpuTensor<T>
where
    T: Sync,
{
    type Item = &'a T;
    type Iter = ndarray::parallel::Parallel<ArrayView<'a, T, IxDyn>>;

    fn into_par_iter(self) -> Self::Iter {
        self.data.view().into_par_iter()
    }
}
