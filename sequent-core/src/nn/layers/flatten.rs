use super::{check_gradient, Layer};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

/// Collapses every axis but the batch axis: `(batch, d1, .., dn) -> (batch, d1·..·dn)`.
pub struct Flatten<T, B> {
    input_shape: Option<Vec<usize>>,
    output: Option<B>,
    input_grad: Option<B>,
    dtype: std::marker::PhantomData<T>,
}

impl<T: Scalar, B: Tensor<T>> Flatten<T, B> {
    pub fn new() -> Self {
        Self { input_shape: None, output: None, input_grad: None, dtype: std::marker::PhantomData }
    }
}

impl<T: Scalar, B: Tensor<T>> Default for Flatten<T, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for Flatten<T, B> {
    fn name(&self) -> &str {
        "flatten"
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        let shape = self.output_shape(&input.shape())?;
        self.output = Some(input.reshape(&shape)?);
        self.input_shape = Some(input.shape());
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let (shape, output) = match (&self.input_shape, &self.output) {
            (Some(shape), Some(output)) => (shape, output),
            _ => return Err(NetError::not_forwarded("flatten")),
        };
        check_gradient("flatten", &output.shape(), &gradient.shape())?;
        self.input_grad = Some(gradient.reshape(shape)?);
        Ok(())
    }

    fn output(&self) -> Option<&B> {
        self.output.as_ref()
    }

    fn input_gradient(&self) -> Option<&B> {
        self.input_grad.as_ref()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        match input_shape.split_first() {
            Some((&batch, rest)) if !rest.is_empty() => Ok(vec![batch, rest.iter().product()]),
            _ => Err(NetError::invalid(format!("flatten needs a batch axis and at least one more, got {:?}", input_shape))),
        }
    }
}
