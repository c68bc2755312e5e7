use super::Recurrent;
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::layers::{check_gradient, Layer, Param};

use log::debug;
use std::marker::PhantomData;

/// How the outputs of the two directions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    Sum,
    Mean,
    Mul,
    /// Stacks both outputs along the feature axis, doubling its size.
    #[default]
    Concat,
}

/// Runs one recurrent layer over the sequence and a second one over the
/// time-reversed sequence, then merges both outputs.
///
/// With `return_sequences` the reversed layer's output is flipped back so
/// that step `t` of both directions lines up before merging.
pub struct Bidirectional<T, B, R> {
    name: String,
    mode: MergeMode,
    forward_layer: R,
    backward_layer: R,
    forward_output: Option<B>,
    backward_output: Option<B>,
    output: Option<B>,
    input_grad: Option<B>,
    dtype: PhantomData<T>,
}

impl<T: Scalar, B: Tensor<T>, R: Recurrent<T, B>> Bidirectional<T, B, R> {
    /// Wraps `layer`; the reversed direction gets a freshly initialised twin.
    pub fn new(layer: R, mode: MergeMode) -> Self {
        let backward_layer = layer.twin();
        Self::build(layer, backward_layer, mode)
    }

    pub fn from_pair(forward_layer: R, backward_layer: R, mode: MergeMode) -> Result<Self> {
        if forward_layer.units() != backward_layer.units()
            || forward_layer.return_sequences() != backward_layer.return_sequences()
        {
            return Err(NetError::invalid(format!(
                "bidirectional layers '{}' and '{}' differ in units or return_sequences",
                forward_layer.name(),
                backward_layer.name()
            )));
        }
        Ok(Self::build(forward_layer, backward_layer, mode))
    }

    fn build(forward_layer: R, backward_layer: R, mode: MergeMode) -> Self {
        Self {
            name: format!("bidirectional_{}", forward_layer.name()),
            mode,
            forward_layer,
            backward_layer,
            forward_output: None,
            backward_output: None,
            output: None,
            input_grad: None,
            dtype: PhantomData,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    pub fn forward_layer(&self) -> &R {
        &self.forward_layer
    }

    pub fn backward_layer(&self) -> &R {
        &self.backward_layer
    }

    fn feature_axis(&self, output: &B) -> usize {
        output.ndim() - 1
    }
}

impl<T: Scalar, B: Tensor<T>, R: Recurrent<T, B>> Layer<T, B> for Bidirectional<T, B, R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        if input.ndim() != 3 {
            return Err(NetError::invalid(format!(
                "layer '{}' expects a (batch, steps, features) input, got {:?}",
                self.name,
                input.shape()
            )));
        }
        self.forward_layer.forward(input)?;
        self.backward_layer.forward(&input.reverse_axis(1))?;

        let forward_output = self
            .forward_layer
            .output()
            .ok_or_else(|| NetError::not_forwarded(self.forward_layer.name()))?
            .clone();
        let reversed = self
            .backward_layer
            .output()
            .ok_or_else(|| NetError::not_forwarded(self.backward_layer.name()))?;
        let backward_output = if self.forward_layer.return_sequences() {
            reversed.reverse_axis(1)
        } else {
            reversed.clone()
        };

        let output = match self.mode {
            MergeMode::Sum => forward_output.add(&backward_output)?,
            MergeMode::Mean => forward_output.add(&backward_output)?.mul_scalar(T::from_f64_lossy(0.5)),
            MergeMode::Mul => forward_output.mul(&backward_output)?,
            MergeMode::Concat => {
                let axis = self.feature_axis(&forward_output);
                B::concatenate(&[&forward_output, &backward_output], axis)?
            }
        };
        self.forward_output = Some(forward_output);
        self.backward_output = Some(backward_output);
        self.output = Some(output);
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let (output, forward_output, backward_output) =
            match (&self.output, &self.forward_output, &self.backward_output) {
                (Some(o), Some(f), Some(b)) => (o, f, b),
                _ => return Err(NetError::not_forwarded(&self.name)),
            };
        check_gradient(&self.name, &output.shape(), &gradient.shape())?;

        let (forward_grad, backward_grad) = match self.mode {
            MergeMode::Sum => (gradient.clone(), gradient.clone()),
            MergeMode::Mean => {
                let half = gradient.mul_scalar(T::from_f64_lossy(0.5));
                (half.clone(), half)
            }
            MergeMode::Mul => (gradient.mul(backward_output)?, gradient.mul(forward_output)?),
            MergeMode::Concat => {
                let axis = self.feature_axis(gradient);
                let units = self.forward_layer.units();
                (gradient.slice(axis, 0, units), gradient.slice(axis, units, 2 * units))
            }
        };
        let backward_grad = if self.forward_layer.return_sequences() {
            backward_grad.reverse_axis(1)
        } else {
            backward_grad
        };

        self.forward_layer.backward(&forward_grad)?;
        self.backward_layer.backward(&backward_grad)?;

        let forward_input = self
            .forward_layer
            .input_gradient()
            .ok_or_else(|| NetError::not_forwarded(self.forward_layer.name()))?;
        let backward_input = self
            .backward_layer
            .input_gradient()
            .ok_or_else(|| NetError::not_forwarded(self.backward_layer.name()))?;
        self.input_grad = Some(forward_input.add(&backward_input.reverse_axis(1))?);
        Ok(())
    }

    fn output(&self) -> Option<&B> {
        self.output.as_ref()
    }

    fn input_gradient(&self) -> Option<&B> {
        self.input_grad.as_ref()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let mut shape = self.forward_layer.output_shape(input_shape)?;
        if self.mode == MergeMode::Concat {
            if let Some(last) = shape.last_mut() {
                *last *= 2;
            }
        }
        debug!("{}: {:?} -> {:?}", self.name, input_shape, shape);
        Ok(shape)
    }

    fn parameters(&self) -> Vec<&Param<T, B>> {
        let mut params = self.forward_layer.parameters();
        params.extend(self.backward_layer.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param<T, B>> {
        let mut params = self.forward_layer.parameters_mut();
        params.extend(self.backward_layer.parameters_mut());
        params
    }

    fn set_training(&mut self, training: bool) {
        self.forward_layer.set_training(training);
        self.backward_layer.set_training(training);
    }
}
