use super::{check_dim, check_gradient, check_rank, Layer, Param};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::activations::Activation;
use crate::nn::initializers::Initializer;

use rand::Rng;

/// Fully connected layer: `Z = X·W + b`, `A = g(Z)`.
///
/// Inputs are `(batch, in_features)` or `(batch, steps, in_features)`; in the
/// latter case the same weights are applied to every step. Weights are
/// stored `(in_features, units)`.
pub struct Dense<T, B> {
    name: String,
    in_features: usize,
    units: usize,
    activation: Activation,
    weights: Param<T, B>,
    bias: Option<Param<T, B>>,
    input: Option<B>,
    z: Option<B>,
    output: Option<B>,
    input_grad: Option<B>,
}

impl<T: Scalar, B: Tensor<T>> Dense<T, B> {
    pub fn new(in_features: usize, units: usize, activation: Activation) -> Self {
        Self::with_rng(in_features, units, activation, &mut rand::thread_rng())
    }

    /// Like [`Dense::new`], drawing the initial weights from `rng`.
    pub fn with_rng<R: Rng + ?Sized>(in_features: usize, units: usize, activation: Activation, rng: &mut R) -> Self {
        let initializer = match activation {
            Activation::Relu | Activation::LeakyRelu(_) | Activation::Elu(_) => Initializer::HeUniform,
            _ => Initializer::GlorotUniform,
        };
        let weights = initializer.draw(&[in_features, units], in_features, units, rng);
        Self::build(weights, Some(B::zeros(&[units])), activation)
    }

    pub fn with_initializer<R: Rng + ?Sized>(
        in_features: usize,
        units: usize,
        activation: Activation,
        initializer: Initializer,
        rng: &mut R,
    ) -> Result<Self> {
        let weights = initializer.sample(&[in_features, units], in_features, units, rng)?;
        Ok(Self::build(weights, Some(B::zeros(&[units])), activation))
    }

    /// Builds the layer around existing weights `(in_features, units)` and an
    /// optional bias `(units)`.
    pub fn from_weights(weights: B, bias: Option<B>, activation: Activation) -> Result<Self> {
        let shape = weights.shape();
        if shape.len() != 2 {
            return Err(NetError::invalid(format!("dense weights must be rank 2, got {:?}", shape)));
        }
        if let Some(bias) = &bias {
            if bias.shape() != [shape[1]] {
                return Err(NetError::shape("dense bias", &[shape[1]], &bias.shape()));
            }
        }
        Ok(Self::build(weights, bias, activation))
    }

    fn build(weights: B, bias: Option<B>, activation: Activation) -> Self {
        let shape = weights.shape();
        Self {
            name: "dense".to_string(),
            in_features: shape[0],
            units: shape[1],
            activation,
            weights: Param::new("kernel", weights),
            bias: bias.map(|b| Param::new("bias", b)),
            input: None,
            z: None,
            output: None,
            input_grad: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn weights(&self) -> &B {
        &self.weights.value
    }

    pub fn weights_grad(&self) -> &B {
        &self.weights.grad
    }

    pub fn bias(&self) -> Option<&B> {
        self.bias.as_ref().map(|b| &b.value)
    }

    /// Collapses leading axes so the contraction is a plain matrix product.
    fn rows(&self, tensor: &B, width: usize) -> Result<B> {
        tensor.reshape(&[tensor.size() / width.max(1), width])
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for Dense<T, B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        let shape = input.shape();
        check_rank(&self.name, &shape, &[2, 3])?;
        check_dim(&self.name, &shape, shape.len() - 1, self.in_features)?;

        let flat = self.rows(input, self.in_features)?;
        let mut z = flat.matmul(&self.weights.value)?;
        if let Some(bias) = &self.bias {
            z = z.add(&bias.value)?;
        }
        let mut out_shape = shape.clone();
        out_shape[shape.len() - 1] = self.units;
        let z = z.reshape(&out_shape)?;

        self.output = Some(self.activation.activate(&z));
        self.z = Some(z);
        self.input = Some(input.clone());
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let (input, z, output) = match (&self.input, &self.z, &self.output) {
            (Some(input), Some(z), Some(output)) => (input, z, output),
            _ => return Err(NetError::not_forwarded(&self.name)),
        };
        check_gradient(&self.name, &output.shape(), &gradient.shape())?;

        // softmax layers take the fused Jacobian-vector path
        let dz = self.activation.backward(z, output, gradient)?;
        let dz_rows = self.rows(&dz, self.units)?;
        let x_rows = self.rows(input, self.in_features)?;

        self.weights.grad = x_rows.transpose().matmul(&dz_rows)?;
        if let Some(bias) = &mut self.bias {
            bias.grad = dz_rows.sum_axis(0);
        }
        let dx = dz_rows.matmul(&self.weights.value.transpose())?;
        self.input_grad = Some(dx.reshape(&input.shape())?);
        Ok(())
    }

    fn output(&self) -> Option<&B> {
        self.output.as_ref()
    }

    fn input_gradient(&self) -> Option<&B> {
        self.input_grad.as_ref()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        check_rank(&self.name, input_shape, &[2, 3])?;
        check_dim(&self.name, input_shape, input_shape.len() - 1, self.in_features)?;
        let mut shape = input_shape.to_vec();
        let last = shape.len() - 1;
        shape[last] = self.units;
        Ok(shape)
    }

    fn parameters(&self) -> Vec<&Param<T, B>> {
        let mut params = vec![&self.weights];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param<T, B>> {
        let mut params = vec![&mut self.weights];
        params.extend(self.bias.as_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use crate::nn::optimizers::Sgd;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type Tensor64 = CpuTensor<f64>;

    fn fixed_layer(activation: Activation) -> Dense<f64, Tensor64> {
        let w = CpuTensor::new(array![[0.1, -0.2, 0.3], [0.4, 0.5, -0.6]].into_dyn());
        let b = CpuTensor::new(array![0.01, 0.02, 0.03].into_dyn());
        Dense::from_weights(w, Some(b), activation).unwrap()
    }

    #[test]
    fn test_forward_linear() {
        let mut layer = fixed_layer(Activation::Linear);
        let x = CpuTensor::new(array![[1.0, 2.0]].into_dyn());
        layer.forward(&x).unwrap();
        let out = layer.output().unwrap().get_data();
        let expected = array![[0.91, 0.82, -0.87]].into_dyn();
        for (a, e) in out.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-12);
        }
    }

    #[test]
    fn test_backward_before_forward_fails() {
        let mut layer = fixed_layer(Activation::Sigmoid);
        let g = CpuTensor::new(array![[1.0, 1.0, 1.0]].into_dyn());
        assert!(matches!(layer.backward(&g), Err(NetError::NotForwarded { .. })));
    }

    #[test]
    fn test_wrong_feature_count_is_shape_mismatch() {
        let mut layer = fixed_layer(Activation::Relu);
        let x = CpuTensor::new(array![[1.0, 2.0, 3.0]].into_dyn());
        assert!(matches!(layer.forward(&x), Err(NetError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_gradients_linear() {
        let mut layer = fixed_layer(Activation::Linear);
        let x = CpuTensor::new(array![[1.0, 2.0], [3.0, -1.0]].into_dyn());
        layer.forward(&x).unwrap();
        let g = CpuTensor::new(array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]].into_dyn());
        layer.backward(&g).unwrap();

        assert_eq!(layer.weights_grad().get_data(), &array![[1.0, 3.0, 0.0], [2.0, -1.0, 0.0]].into_dyn());
        assert_eq!(layer.bias.as_ref().unwrap().grad.get_data(), &array![1.0, 1.0, 0.0].into_dyn());
        let dx = layer.input_gradient().unwrap().get_data();
        assert_eq!(dx, &array![[0.1, 0.4], [-0.2, 0.5]].into_dyn());
    }

    #[test]
    fn test_sequence_input_shares_weights() {
        let mut layer = Dense::<f64, Tensor64>::with_rng(4, 3, Activation::Tanh, &mut StdRng::seed_from_u64(1));
        let x = CpuTensor::<f64>::random(&[2, 5, 4]);
        layer.forward(&x).unwrap();
        assert_eq!(layer.output().unwrap().shape(), vec![2, 5, 3]);

        let step = x.index_axis_move(1, 2);
        let mut single = Dense::from_weights(layer.weights().clone(), layer.bias().cloned(), Activation::Tanh).unwrap();
        single.forward(&step).unwrap();
        let expected = layer.output().unwrap().index_axis_move(1, 2);
        for (a, b) in single.output().unwrap().iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12);
        }

        layer.backward(&CpuTensor::ones(&[2, 5, 3])).unwrap();
        assert_eq!(layer.input_gradient().unwrap().shape(), vec![2, 5, 4]);
    }

    #[test]
    fn test_update_moves_weights_against_gradient() {
        let mut layer = fixed_layer(Activation::Linear);
        let x = CpuTensor::new(array![[1.0, 1.0]].into_dyn());
        layer.forward(&x).unwrap();
        layer.backward(&CpuTensor::ones(&[1, 3])).unwrap();
        let before = layer.weights().clone();
        let mut sgd = Sgd::<f64, Tensor64>::new(0.5, 0.0);
        layer.update(&mut sgd).unwrap();
        let diff = before.sub(layer.weights()).unwrap();
        assert!(diff.iter().all(|&d| (d - 0.5).abs() < 1e-12));
        assert_eq!(layer.parameter_count(), 9);
    }

    #[test]
    fn test_without_bias_has_single_parameter() {
        let layer = Dense::<f32, CpuTensor<f32>>::new(3, 2, Activation::Relu).without_bias();
        assert_eq!(layer.parameters().len(), 1);
        assert_eq!(layer.output_shape(&[8, 3]).unwrap(), vec![8, 2]);
        assert!(layer.output_shape(&[8, 4]).is_err());
    }

    #[test]
    fn test_invalid_initializer_is_reported() {
        let init = Initializer::RandomUniform { min: f64::NAN, max: 1.0 };
        let result = Dense::<f64, Tensor64>::with_initializer(3, 2, Activation::Linear, init, &mut rand::thread_rng());
        assert!(matches!(result, Err(NetError::InvalidArgument(_))));

        let init = Initializer::RandomNormal { mean: 0.0, std: 0.1 };
        let layer = Dense::<f64, Tensor64>::with_initializer(3, 2, Activation::Linear, init, &mut rand::thread_rng()).unwrap();
        assert_eq!(layer.parameter_count(), 8);
    }
}
