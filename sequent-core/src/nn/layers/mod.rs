//! Layer abstraction shared by every building block of a [`Sequential`](crate::nn::sequential::Sequential) model.
//!
//! A layer caches what its backward pass needs during `forward`, computes the
//! gradients of its parameters and of its input during `backward`, and lets an
//! optimizer mutate its parameters during `update`. The cycle is strictly
//! `forward -> backward -> update` per training step.

pub mod batch_norm;
pub mod conv2d;
pub mod conv2d_transpose;
pub mod dense;
pub mod dropout;
pub mod embedding;
pub mod flatten;
pub mod pooling;
pub mod recurrent;

pub use batch_norm::BatchNormalization;
pub use conv2d::{Conv2D, ConvOptions, Padding};
pub use conv2d_transpose::Conv2DTranspose;
pub use dense::Dense;
pub use dropout::Dropout;
pub use embedding::Embedding;
pub use flatten::Flatten;
pub use pooling::{AveragePooling2D, MaxPooling2D};
pub use recurrent::{Bidirectional, Gru, Lstm, MergeMode, Recurrent};

use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::optimizers::Optimizer;

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque, process-unique identity of a parameter tensor.
///
/// Optimizers key their per-parameter state on this handle, so the state
/// follows the parameter no matter where its storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

impl ParamId {
    pub fn next() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A parameter tensor together with its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Param<T, B> {
    id: ParamId,
    name: String,
    pub value: B,
    pub grad: B,
    trainable: bool,
    dtype: PhantomData<T>,
}

impl<T: Scalar, B: Tensor<T>> Param<T, B> {
    pub fn new(name: impl Into<String>, value: B) -> Self {
        let grad = B::zeros_like(&value);
        Self {
            id: ParamId::next(),
            name: name.into(),
            value,
            grad,
            trainable: true,
            dtype: PhantomData,
        }
    }

    /// A buffer that is persisted with the weights but never optimized.
    pub fn non_trainable(name: impl Into<String>, value: B) -> Self {
        Self { trainable: false, ..Self::new(name, value) }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn shape(&self) -> Vec<usize> {
        self.value.shape()
    }

    pub fn zero_grad(&mut self) {
        self.grad = B::zeros_like(&self.value);
    }

    /// Replaces the value, keeping identity; the new value must have the same shape.
    pub fn assign(&mut self, value: B) -> Result<()> {
        if value.shape() != self.value.shape() {
            return Err(NetError::shape(
                format!("assign to parameter '{}'", self.name),
                &self.value.shape(),
                &value.shape(),
            ));
        }
        self.value = value;
        Ok(())
    }
}

/// Polymorphic contract implemented by every layer.
///
/// Shapes are batch-first: `(batch, features)` for dense layers,
/// `(batch, steps, features)` for sequences and `(batch, height, width,
/// channels)` for images.
pub trait Layer<T: Scalar, B: Tensor<T>>: Send {
    fn name(&self) -> &str;

    /// Computes and caches this layer's output for `input`.
    fn forward(&mut self, input: &B) -> Result<()>;

    /// Forward pass fed by the cached output of the previous layer.
    fn forward_from(&mut self, previous: &dyn Layer<T, B>) -> Result<()> {
        let input = previous
            .output()
            .ok_or_else(|| NetError::not_forwarded(previous.name()))?;
        self.forward(input)
    }

    /// Backward pass given the gradient of the loss with respect to this layer's output.
    fn backward(&mut self, gradient: &B) -> Result<()>;

    /// Backward pass fed by the cached input-gradient of the next layer.
    fn backward_from(&mut self, next: &dyn Layer<T, B>) -> Result<()> {
        let gradient = next.input_gradient().ok_or_else(|| NetError::Unsupported {
            layer: next.name().to_string(),
            operation: "propagating a gradient to its input".to_string(),
        })?;
        self.backward(gradient)
    }

    /// Output of the last forward pass.
    fn output(&self) -> Option<&B>;

    /// Gradient with respect to the input of the last backward pass.
    fn input_gradient(&self) -> Option<&B>;

    /// Shape produced for a given input shape, without running the layer.
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>>;

    fn parameters(&self) -> Vec<&Param<T, B>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param<T, B>> {
        Vec::new()
    }

    /// Pushes the accumulated gradients of every trainable parameter through `optimizer`.
    fn update(&mut self, optimizer: &mut dyn Optimizer<T, B>) -> Result<()> {
        for param in self.parameters_mut() {
            if param.trainable() {
                optimizer.minimize(param.id(), &mut param.value, &param.grad)?;
            }
        }
        Ok(())
    }

    /// Switches train-only behaviour (dropout masks, batch statistics).
    fn set_training(&mut self, _training: bool) {}

    /// Whether gradients can flow back through this layer's input.
    fn propagates_input_gradient(&self) -> bool {
        true
    }

    /// Factor this layer applies to its parameter gradients on top of the
    /// exact derivative of the loss.
    fn gradient_scale(&self) -> T {
        T::one()
    }

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.value.size()).sum()
    }
}

pub(crate) fn check_rank(layer: &str, shape: &[usize], ranks: &[usize]) -> Result<()> {
    if ranks.contains(&shape.len()) {
        Ok(())
    } else {
        Err(NetError::invalid(format!(
            "layer '{}' expects an input of rank {:?}, got shape {:?}",
            layer, ranks, shape
        )))
    }
}

pub(crate) fn check_dim(layer: &str, shape: &[usize], axis: usize, expected: usize) -> Result<()> {
    if shape.get(axis) == Some(&expected) {
        return Ok(());
    }
    let mut wanted = shape.to_vec();
    if axis < wanted.len() {
        wanted[axis] = expected;
    }
    Err(NetError::shape(format!("input of layer '{}'", layer), &wanted, shape))
}

/// Gradient shape must match the cached output shape.
pub(crate) fn check_gradient(layer: &str, output: &[usize], gradient: &[usize]) -> Result<()> {
    if output == gradient {
        Ok(())
    } else {
        Err(NetError::shape(format!("gradient of layer '{}'", layer), output, gradient))
    }
}
