use super::{check_gradient, Layer};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

use ndarray::Array;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Inverted dropout: in training mode every element is zeroed with
/// probability `rate` and the survivors are scaled by `1 / (1 - rate)`.
/// In inference mode the layer is the identity.
pub struct Dropout<T, B> {
    rate: f64,
    training: bool,
    rng: StdRng,
    mask: Option<B>,
    output: Option<B>,
    input_grad: Option<B>,
    dtype: std::marker::PhantomData<T>,
}

impl<T: Scalar, B: Tensor<T>> Dropout<T, B> {
    pub fn new(rate: f64) -> Result<Self> {
        Self::with_rng(rate, StdRng::from_entropy())
    }

    pub fn with_seed(rate: f64, seed: u64) -> Result<Self> {
        Self::with_rng(rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(rate: f64, rng: StdRng) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(NetError::invalid(format!("dropout rate must be in [0, 1), got {}", rate)));
        }
        Ok(Self {
            rate,
            training: true,
            rng,
            mask: None,
            output: None,
            input_grad: None,
            dtype: std::marker::PhantomData,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for Dropout<T, B> {
    fn name(&self) -> &str {
        "dropout"
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        if !self.training || self.rate == 0.0 {
            self.mask = None;
            self.output = Some(input.clone());
            return Ok(());
        }
        let keep = 1.0 - self.rate;
        let scale = T::from_f64_lossy(1.0 / keep);
        let rng = &mut self.rng;
        let mask = Array::from_shape_fn(input.raw_dim(), |_| if rng.gen_bool(keep) { scale } else { T::zero() });
        let mask = B::new(mask);
        self.output = Some(input.mul(&mask)?);
        self.mask = Some(mask);
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let output = self.output.as_ref().ok_or_else(|| NetError::not_forwarded("dropout"))?;
        check_gradient("dropout", &output.shape(), &gradient.shape())?;
        self.input_grad = Some(match &self.mask {
            Some(mask) => gradient.mul(mask)?,
            None => gradient.clone(),
        });
        Ok(())
    }

    fn output(&self) -> Option<&B> {
        self.output.as_ref()
    }

    fn input_gradient(&self) -> Option<&B> {
        self.input_grad.as_ref()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        Ok(input_shape.to_vec())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;

    #[test]
    fn test_inference_is_identity() {
        let mut dropout = Dropout::<f64, CpuTensor<f64>>::with_seed(0.5, 1).unwrap();
        dropout.set_training(false);
        let x = CpuTensor::<f64>::random(&[4, 8]);
        dropout.forward(&x).unwrap();
        assert_eq!(dropout.output().unwrap().get_data(), x.get_data());
    }

    #[test]
    fn test_training_mask_preserves_expectation() {
        let mut dropout = Dropout::<f64, CpuTensor<f64>>::with_seed(0.25, 42).unwrap();
        let x = CpuTensor::<f64>::ones(&[200, 100]);
        dropout.forward(&x).unwrap();
        let out = dropout.output().unwrap().clone();
        assert!(out.iter().all(|&v| v == 0.0 || (v - 4.0 / 3.0).abs() < 1e-12));
        assert!((out.mean() - 1.0).abs() < 0.05);

        // gradient flows only where the mask kept the element
        dropout.backward(&CpuTensor::ones(&[200, 100])).unwrap();
        let grad = dropout.input_gradient().unwrap();
        for (g, o) in grad.iter().zip(out.iter()) {
            assert_eq!(g, o);
        }
    }

    #[test]
    fn test_rate_out_of_range() {
        assert!(Dropout::<f32, CpuTensor<f32>>::new(1.0).is_err());
        assert!(Dropout::<f32, CpuTensor<f32>>::new(-0.1).is_err());
    }
}
