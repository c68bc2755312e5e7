use super::{check_gradient, check_rank, Layer, Param};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::initializers::Initializer;

use ndarray::{Array3, Ix2};
use rand::Rng;

/// Lookup table mapping integer codes `(batch, steps)` to vectors
/// `(batch, steps, dim)`.
///
/// Codes are stored as `T` and must be whole numbers in `0..vocab_size`.
/// The backward pass scatter-adds each output gradient row into the row of
/// its code, divided by the batch size. The input is discrete, so no gradient
/// flows to a preceding layer: an embedding must be the first layer of a model.
pub struct Embedding<T, B> {
    vocab_size: usize,
    dim: usize,
    weights: Param<T, B>,
    indices: Option<Vec<usize>>,
    batch: usize,
    output: Option<B>,
}

impl<T: Scalar, B: Tensor<T>> Embedding<T, B> {
    pub fn new(vocab_size: usize, dim: usize) -> Self {
        Self::with_rng(vocab_size, dim, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(vocab_size: usize, dim: usize, rng: &mut R) -> Self {
        let initializer = Initializer::RandomUniform { min: -0.05, max: 0.05 };
        let weights = initializer.draw(&[vocab_size, dim], vocab_size, dim, rng);
        Self::build(weights)
    }

    /// Builds the table from a `(vocab_size, dim)` weight matrix.
    pub fn from_weights(weights: B) -> Result<Self> {
        let shape = weights.shape();
        if shape.len() != 2 {
            return Err(NetError::invalid(format!("embedding weights must be rank 2, got {:?}", shape)));
        }
        Ok(Self::build(weights))
    }

    fn build(weights: B) -> Self {
        let shape = weights.shape();
        Self {
            vocab_size: shape[0],
            dim: shape[1],
            weights: Param::new("embeddings", weights),
            indices: None,
            batch: 0,
            output: None,
        }
    }

    pub fn weights(&self) -> &B {
        &self.weights.value
    }

    pub fn weights_grad(&self) -> &B {
        &self.weights.grad
    }

    fn code(&self, value: T) -> Result<usize> {
        let index = value
            .to_usize()
            .filter(|&i| T::from_usize_lossy(i) == value && i < self.vocab_size);
        index.ok_or_else(|| {
            NetError::invalid(format!("embedding code {} is not an index below {}", value, self.vocab_size))
        })
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for Embedding<T, B> {
    fn name(&self) -> &str {
        "embedding"
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        check_rank("embedding", &input.shape(), &[2])?;
        let codes = input
            .get_data()
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| NetError::invalid(e.to_string()))?;
        let (batch, steps) = codes.dim();

        let indices = codes.iter().map(|&v| self.code(v)).collect::<Result<Vec<usize>>>()?;
        let table = self.weights.value.get_data();
        let mut out = Array3::<T>::zeros((batch, steps, self.dim));
        for (position, &index) in indices.iter().enumerate() {
            let (n, t) = (position / steps.max(1), position % steps.max(1));
            for d in 0..self.dim {
                out[[n, t, d]] = table[[index, d]];
            }
        }

        self.indices = Some(indices);
        self.batch = batch;
        self.output = Some(B::new(out.into_dyn()));
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let (indices, output) = match (&self.indices, &self.output) {
            (Some(indices), Some(output)) => (indices, output),
            _ => return Err(NetError::not_forwarded("embedding")),
        };
        check_gradient("embedding", &output.shape(), &gradient.shape())?;

        let scale = self.gradient_scale();
        let rows = gradient.reshape(&[indices.len(), self.dim])?;
        let rows = rows.get_data();
        let mut grad = B::zeros(&[self.vocab_size, self.dim]);
        {
            let table = grad.get_data_mut();
            for (position, &index) in indices.iter().enumerate() {
                for d in 0..self.dim {
                    table[[index, d]] += rows[[position, d]] * scale;
                }
            }
        }
        self.weights.grad = grad;
        Ok(())
    }

    fn output(&self) -> Option<&B> {
        self.output.as_ref()
    }

    fn input_gradient(&self) -> Option<&B> {
        None
    }

    fn propagates_input_gradient(&self) -> bool {
        false
    }

    /// Row gradients are averaged over the batch.
    fn gradient_scale(&self) -> T {
        T::one() / T::from_usize_lossy(self.batch.max(1))
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        check_rank("embedding", input_shape, &[2])?;
        Ok(vec![input_shape[0], input_shape[1], self.dim])
    }

    fn parameters(&self) -> Vec<&Param<T, B>> {
        vec![&self.weights]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param<T, B>> {
        vec![&mut self.weights]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use crate::nn::activations::Activation;
    use crate::nn::layers::Dense;
    use ndarray::{array, Array};

    fn table() -> CpuTensor<f64> {
        CpuTensor::new(Array::from_shape_fn((5, 3), |(i, j)| (i * 10 + j) as f64).into_dyn())
    }

    #[test]
    fn test_gather_then_scatter() {
        let mut embedding = Embedding::from_weights(table()).unwrap();
        let codes = CpuTensor::new(array![[2.0, 0.0], [2.0, 4.0]].into_dyn());
        embedding.forward(&codes).unwrap();
        let out = embedding.output().unwrap();
        assert_eq!(out.shape(), vec![2, 2, 3]);
        assert_eq!(out.get_data()[[0, 0, 1]], 21.0);
        assert_eq!(out.get_data()[[1, 1, 2]], 42.0);

        let mut gradient = CpuTensor::<f64>::zeros(&[2, 2, 3]);
        gradient.get_data_mut()[[1, 1, 0]] = 3.0;
        gradient.get_data_mut()[[1, 1, 2]] = -1.0;
        embedding.backward(&gradient).unwrap();

        let dw = embedding.weights_grad().get_data();
        assert_eq!(dw[[4, 0]], 1.5);
        assert_eq!(dw[[4, 2]], -0.5);
        let others: f64 = (0..4).flat_map(|i| (0..3).map(move |j| (i, j))).map(|(i, j)| dw[[i, j]].abs()).sum();
        assert_eq!(others, 0.0);
        assert!(embedding.input_gradient().is_none());
    }

    #[test]
    fn test_repeated_codes_accumulate() {
        let mut embedding = Embedding::from_weights(table()).unwrap();
        let codes = CpuTensor::new(array![[1.0, 1.0, 1.0]].into_dyn());
        embedding.forward(&codes).unwrap();
        embedding.backward(&CpuTensor::ones(&[1, 3, 3])).unwrap();
        assert!(embedding.weights_grad().index_axis_move(0, 1).iter().all(|&g| g == 3.0));
    }

    #[test]
    fn test_invalid_codes() {
        let mut embedding = Embedding::from_weights(table()).unwrap();
        for bad in [5.0, -1.0, 1.5] {
            let codes = CpuTensor::new(array![[bad]].into_dyn());
            assert!(matches!(embedding.forward(&codes), Err(NetError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_layer_before_embedding_cannot_receive_gradient() {
        let mut embedding = Embedding::from_weights(table()).unwrap();
        embedding.forward(&CpuTensor::new(array![[1.0]].into_dyn())).unwrap();
        embedding.backward(&CpuTensor::ones(&[1, 1, 3])).unwrap();

        let mut dense = Dense::<f64, CpuTensor<f64>>::new(1, 1, Activation::Linear);
        dense.forward(&CpuTensor::ones(&[1, 1])).unwrap();
        assert!(matches!(dense.backward_from(&embedding), Err(NetError::Unsupported { .. })));
    }
}
