use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::layers::ParamId;

use ndarray::Zip;
use std::collections::HashMap;
use std::marker::PhantomData;

/// Mutates parameters in place from their gradients.
///
/// One optimizer is shared by every layer of a model; auxiliary state is kept
/// per [`ParamId`] and created lazily (zero-filled) the first time a
/// parameter is seen.
pub trait Optimizer<T: Scalar, B: Tensor<T>>: Send {
    fn name(&self) -> &str;

    fn minimize(&mut self, id: ParamId, param: &mut B, grad: &B) -> Result<()>;

    /// Advances time-dependent hyper-parameters once per training step.
    fn step(&mut self) {}

    fn learning_rate(&self) -> T;
    fn set_learning_rate(&mut self, learning_rate: T);

    /// Forgets all per-parameter state.
    fn reset(&mut self);
}

fn check_shapes<T: Scalar, B: Tensor<T>>(id: ParamId, param: &B, grad: &B) -> Result<()> {
    if param.shape() == grad.shape() {
        Ok(())
    } else {
        Err(NetError::shape(format!("gradient of parameter {}", id), &param.shape(), &grad.shape()))
    }
}

fn state_for<'a, T: Scalar, B: Tensor<T>>(state: &'a mut HashMap<ParamId, B>, id: ParamId, param: &B) -> &'a mut B {
    state.entry(id).or_insert_with(|| B::zeros_like(param))
}

pub struct Sgd<T, B> {
    pub learning_rate: T,
    pub momentum: T,
    velocity: HashMap<ParamId, B>,
}

impl<T: Scalar, B: Tensor<T>> Sgd<T, B> {
    pub fn new(learning_rate: T, momentum: T) -> Self {
        Self { learning_rate, momentum, velocity: HashMap::new() }
    }
}

impl<T: Scalar, B: Tensor<T>> Default for Sgd<T, B> {
    fn default() -> Self {
        Self::new(T::from_f64_lossy(0.01), T::zero())
    }
}

impl<T: Scalar, B: Tensor<T>> Optimizer<T, B> for Sgd<T, B> {
    fn name(&self) -> &str {
        "sgd"
    }

    fn minimize(&mut self, id: ParamId, param: &mut B, grad: &B) -> Result<()> {
        check_shapes(id, param, grad)?;
        let (lr, momentum) = (self.learning_rate, self.momentum);
        let velocity = state_for(&mut self.velocity, id, param);

        Zip::from(param.get_data_mut())
            .and(velocity.get_data_mut())
            .and(grad.get_data())
            .for_each(|p, v, &g| {
                *v = momentum * *v + g;
                *p -= lr * *v;
            });
        Ok(())
    }

    fn learning_rate(&self) -> T {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: T) {
        self.learning_rate = learning_rate;
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

pub struct RmsProp<T, B> {
    pub learning_rate: T,
    pub rho: T,
    pub epsilon: T,
    state: HashMap<ParamId, B>,
    dtype: PhantomData<T>,
}

impl<T: Scalar, B: Tensor<T>> RmsProp<T, B> {
    pub fn new(learning_rate: T, rho: T, epsilon: T) -> Self {
        Self { learning_rate, rho, epsilon, state: HashMap::new(), dtype: PhantomData }
    }
}

impl<T: Scalar, B: Tensor<T>> Default for RmsProp<T, B> {
    fn default() -> Self {
        Self::new(T::from_f64_lossy(0.001), T::from_f64_lossy(0.9), T::from_f64_lossy(1e-7))
    }
}

impl<T: Scalar, B: Tensor<T>> Optimizer<T, B> for RmsProp<T, B> {
    fn name(&self) -> &str {
        "rmsprop"
    }

    fn minimize(&mut self, id: ParamId, param: &mut B, grad: &B) -> Result<()> {
        check_shapes(id, param, grad)?;
        let (lr, rho, eps) = (self.learning_rate, self.rho, self.epsilon);
        let velocity = state_for(&mut self.state, id, param);

        Zip::from(param.get_data_mut())
            .and(velocity.get_data_mut())
            .and(grad.get_data())
            .for_each(|p, v, &g| {
                // moving average of the squared gradients
                *v = rho * *v + (T::one() - rho) * g * g;
                *p -= lr * g / (v.sqrt() + eps);
            });
        Ok(())
    }

    fn learning_rate(&self) -> T {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: T) {
        self.learning_rate = learning_rate;
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}

/// Adam with bias correction folded into the step size, plus optional
/// decoupled weight decay (AdamW).
pub struct Adam<T, B> {
    pub learning_rate: T,
    pub beta1: T,
    pub beta2: T,
    pub epsilon: T,
    pub weight_decay: T,
    beta1_t: T,
    beta2_t: T,
    lr_t: T,
    moments: HashMap<ParamId, (B, B)>,
}

impl<T: Scalar, B: Tensor<T>> Adam<T, B> {
    pub fn new(learning_rate: T, beta1: T, beta2: T, epsilon: T) -> Self {
        let mut adam = Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay: T::zero(),
            beta1_t: beta1,
            beta2_t: beta2,
            lr_t: learning_rate,
            moments: HashMap::new(),
        };
        adam.refresh_step_size();
        adam
    }

    pub fn with_weight_decay(mut self, weight_decay: T) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// `lr * sqrt(1 - beta2^t) / (1 - beta1^t)`
    pub fn step_size(&self) -> T {
        self.lr_t
    }

    fn refresh_step_size(&mut self) {
        self.lr_t = self.learning_rate * (T::one() - self.beta2_t).sqrt() / (T::one() - self.beta1_t);
    }
}

impl<T: Scalar, B: Tensor<T>> Default for Adam<T, B> {
    fn default() -> Self {
        Self::new(
            T::from_f64_lossy(0.001),
            T::from_f64_lossy(0.9),
            T::from_f64_lossy(0.999),
            T::from_f64_lossy(1e-7),
        )
    }
}

impl<T: Scalar, B: Tensor<T>> Optimizer<T, B> for Adam<T, B> {
    fn name(&self) -> &str {
        "adam"
    }

    fn minimize(&mut self, id: ParamId, param: &mut B, grad: &B) -> Result<()> {
        check_shapes(id, param, grad)?;
        let (beta1, beta2, eps, lr_t) = (self.beta1, self.beta2, self.epsilon, self.lr_t);
        let decay = self.learning_rate * self.weight_decay;

        let (m_state, v_state) = self
            .moments
            .entry(id)
            .or_insert_with(|| (B::zeros_like(param), B::zeros_like(param)));

        Zip::from(param.get_data_mut())
            .and(m_state.get_data_mut())
            .and(v_state.get_data_mut())
            .and(grad.get_data())
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (T::one() - beta1) * g;
                *v = beta2 * *v + (T::one() - beta2) * g * g;
                if decay > T::zero() {
                    *p -= decay * *p;
                }
                *p -= lr_t * *m / (v.sqrt() + eps);
            });
        Ok(())
    }

    fn step(&mut self) {
        self.beta1_t *= self.beta1;
        self.beta2_t *= self.beta2;
        self.refresh_step_size();
    }

    fn learning_rate(&self) -> T {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: T) {
        self.learning_rate = learning_rate;
        self.refresh_step_size();
    }

    fn reset(&mut self) {
        self.moments.clear();
        self.beta1_t = self.beta1;
        self.beta2_t = self.beta2;
        self.refresh_step_size();
    }
}
