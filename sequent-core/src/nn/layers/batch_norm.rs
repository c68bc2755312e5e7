use super::{check_gradient, Layer, Param};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

use ndarray::{Array1, Array2, Axis, Ix2};

struct NormCache<T> {
    /// `x̂` laid out as `(reduced, features)`.
    normalized: Array2<T>,
    inv_std: Array1<T>,
    batch_statistics: bool,
    input_shape: Vec<usize>,
}

/// Batch normalization over every axis except the kept (feature) axes.
///
/// Training mode normalises with the statistics of the current batch and
/// folds them into moving averages: `moving = momentum·moving +
/// (1 - momentum)·batch`. Inference mode normalises with the moving averages.
pub struct BatchNormalization<T, B> {
    axes: Vec<usize>,
    sizes: Vec<usize>,
    momentum: T,
    epsilon: T,
    training: bool,
    gamma: Option<Param<T, B>>,
    beta: Option<Param<T, B>>,
    moving_mean: Param<T, B>,
    moving_variance: Param<T, B>,
    cache: Option<NormCache<T>>,
    output: Option<B>,
    input_grad: Option<B>,
}

impl<T: Scalar, B: Tensor<T>> BatchNormalization<T, B> {
    /// Normalises the last axis, which has `features` entries.
    pub fn new(features: usize) -> Self {
        Self::build(vec![usize::MAX], vec![features])
    }

    /// Keeps `axes` (positions in the full input shape, batch axis excluded)
    /// with the given `sizes`; statistics are reduced over all other axes.
    pub fn with_axes(axes: &[usize], sizes: &[usize]) -> Result<Self> {
        if axes.is_empty() || axes.len() != sizes.len() {
            return Err(NetError::invalid(format!(
                "batch normalization needs one size per kept axis, got axes {:?} and sizes {:?}",
                axes, sizes
            )));
        }
        if axes.contains(&0) || axes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(NetError::invalid(format!(
                "kept axes must be strictly increasing and exclude the batch axis, got {:?}",
                axes
            )));
        }
        Ok(Self::build(axes.to_vec(), sizes.to_vec()))
    }

    fn build(axes: Vec<usize>, sizes: Vec<usize>) -> Self {
        Self {
            axes,
            momentum: T::from_f64_lossy(0.99),
            epsilon: T::from_f64_lossy(1e-3),
            training: true,
            gamma: Some(Param::new("gamma", B::ones(&sizes))),
            beta: Some(Param::new("beta", B::zeros(&sizes))),
            moving_mean: Param::non_trainable("moving_mean", B::zeros(&sizes)),
            moving_variance: Param::non_trainable("moving_variance", B::ones(&sizes)),
            sizes,
            cache: None,
            output: None,
            input_grad: None,
        }
    }

    pub fn with_momentum(mut self, momentum: T) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_epsilon(mut self, epsilon: T) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Drops the learned shift `beta`.
    pub fn without_center(mut self) -> Self {
        self.beta = None;
        self
    }

    /// Drops the learned scale `gamma`.
    pub fn without_scale(mut self) -> Self {
        self.gamma = None;
        self
    }

    pub fn moving_mean(&self) -> &B {
        &self.moving_mean.value
    }

    pub fn moving_variance(&self) -> &B {
        &self.moving_variance.value
    }

    fn features(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Kept axes resolved against a concrete rank.
    fn kept_axes(&self, rank: usize) -> Vec<usize> {
        if self.axes == [usize::MAX] {
            vec![rank.saturating_sub(1)]
        } else {
            self.axes.clone()
        }
    }

    /// Permutation moving the reduced axes first and the kept axes last.
    fn permutation(&self, shape: &[usize]) -> Result<Vec<usize>> {
        let kept = self.kept_axes(shape.len());
        if shape.len() < 2 || kept.iter().any(|&a| a == 0 || a >= shape.len()) {
            return Err(NetError::invalid(format!(
                "batch normalization over axes {:?} does not fit an input of shape {:?}",
                kept, shape
            )));
        }
        let actual: Vec<usize> = kept.iter().map(|&a| shape[a]).collect();
        if actual != self.sizes {
            return Err(NetError::shape("batch normalization features", &self.sizes, &actual));
        }
        let mut perm: Vec<usize> = (0..shape.len()).filter(|a| !kept.contains(a)).collect();
        perm.extend(kept);
        Ok(perm)
    }

    fn to_matrix(&self, tensor: &B, perm: &[usize]) -> Result<Array2<T>> {
        let features = self.features();
        tensor
            .permute(perm)?
            .reshape(&[tensor.size() / features.max(1), features])?
            .into_data()
            .into_dimensionality::<Ix2>()
            .map_err(|e| NetError::invalid(e.to_string()))
    }

    fn from_matrix(&self, matrix: Array2<T>, shape: &[usize], perm: &[usize]) -> Result<B> {
        let permuted: Vec<usize> = perm.iter().map(|&a| shape[a]).collect();
        let mut inverse = vec![0; perm.len()];
        for (i, &a) in perm.iter().enumerate() {
            inverse[a] = i;
        }
        B::new(matrix.into_dyn()).reshape(&permuted)?.permute(&inverse)
    }

    fn row(param: &Param<T, B>) -> Array1<T> {
        Array1::from_iter(param.value.iter().copied())
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for BatchNormalization<T, B> {
    fn name(&self) -> &str {
        "batch_normalization"
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        let shape = input.shape();
        let perm = self.permutation(&shape)?;
        let x = self.to_matrix(input, &perm)?;
        let rows = T::from_usize_lossy(x.nrows().max(1));

        let (mean, variance) = if self.training {
            let mean = x.sum_axis(Axis(0)) / rows;
            let centered = &x - &mean;
            let variance = (&centered * &centered).sum_axis(Axis(0)) / rows;

            let momentum = self.momentum;
            let decay = T::one() - momentum;
            let moving_mean = Self::row(&self.moving_mean) * momentum + &mean * decay;
            let moving_variance = Self::row(&self.moving_variance) * momentum + &variance * decay;
            self.moving_mean.assign(B::new(moving_mean.into_dyn()).reshape(&self.sizes)?)?;
            self.moving_variance.assign(B::new(moving_variance.into_dyn()).reshape(&self.sizes)?)?;
            (mean, variance)
        } else {
            (Self::row(&self.moving_mean), Self::row(&self.moving_variance))
        };

        let eps = self.epsilon;
        let inv_std = variance.mapv(|v| T::one() / (v + eps).sqrt());
        let normalized = (&x - &mean) * &inv_std;

        let mut y = normalized.clone();
        if let Some(gamma) = &self.gamma {
            y = y * &Self::row(gamma);
        }
        if let Some(beta) = &self.beta {
            y = y + &Self::row(beta);
        }

        self.output = Some(self.from_matrix(y, &shape, &perm)?);
        self.cache = Some(NormCache { normalized, inv_std, batch_statistics: self.training, input_shape: shape });
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let (cache, output) = match (&self.cache, &self.output) {
            (Some(cache), Some(output)) => (cache, output),
            _ => return Err(NetError::not_forwarded("batch_normalization")),
        };
        check_gradient("batch_normalization", &output.shape(), &gradient.shape())?;

        let perm = self.permutation(&cache.input_shape)?;
        let dy = self.to_matrix(gradient, &perm)?;
        let x_hat = &cache.normalized;

        let dgamma = (&dy * x_hat).sum_axis(Axis(0));
        let dbeta = dy.sum_axis(Axis(0));
        let dx_hat = match &self.gamma {
            Some(gamma) => &dy * &Self::row(gamma),
            None => dy.clone(),
        };

        let dx = if cache.batch_statistics {
            // x̂ depends on every row through the batch mean and variance
            let m = T::from_usize_lossy(dx_hat.nrows().max(1));
            let sum_dx_hat = dx_hat.sum_axis(Axis(0));
            let sum_dx_hat_x_hat = (&dx_hat * x_hat).sum_axis(Axis(0));
            let scaled = &dx_hat * m - &sum_dx_hat - x_hat * &sum_dx_hat_x_hat;
            scaled * &(&cache.inv_std / m)
        } else {
            &dx_hat * &cache.inv_std
        };

        let input_grad = self.from_matrix(dx, &cache.input_shape, &perm)?;
        let sizes = self.sizes.clone();
        if let Some(gamma) = &mut self.gamma {
            gamma.grad = B::new(dgamma.into_dyn()).reshape(&sizes)?;
        }
        if let Some(beta) = &mut self.beta {
            beta.grad = B::new(dbeta.into_dyn()).reshape(&sizes)?;
        }
        self.input_grad = Some(input_grad);
        Ok(())
    }

    fn output(&self) -> Option<&B> {
        self.output.as_ref()
    }

    fn input_gradient(&self) -> Option<&B> {
        self.input_grad.as_ref()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.permutation(input_shape)?;
        Ok(input_shape.to_vec())
    }

    fn parameters(&self) -> Vec<&Param<T, B>> {
        let mut params: Vec<&Param<T, B>> = self.gamma.iter().chain(self.beta.iter()).collect();
        params.push(&self.moving_mean);
        params.push(&self.moving_variance);
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param<T, B>> {
        let mut params: Vec<&mut Param<T, B>> = self.gamma.iter_mut().chain(self.beta.iter_mut()).collect();
        params.push(&mut self.moving_mean);
        params.push(&mut self.moving_variance);
        params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
