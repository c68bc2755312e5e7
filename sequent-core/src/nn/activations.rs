use crate::backends::{Scalar, Tensor};
use crate::error::Result;

use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Activation {
    #[default]
    Linear,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu(f64),
    Elu(f64),
    Gelu,
    Softplus,
    Softmax,
}

impl Activation {
    /// Applies the activation to the pre-activation tensor `z`.
    pub fn activate<T: Scalar, B: Tensor<T>>(&self, z: &B) -> B {
        match *self {
            Activation::Linear => z.clone(),
            Activation::Sigmoid => sigmoid(z),
            Activation::Tanh => tanh(z),
            Activation::Relu => relu(z),
            Activation::LeakyRelu(alpha) => leaky_relu(z, T::from_f64_lossy(alpha)),
            Activation::Elu(alpha) => elu(z, T::from_f64_lossy(alpha)),
            Activation::Gelu => gelu(z),
            Activation::Softplus => z.map(|x| softplus_scalar(x)),
            Activation::Softmax => softmax(z),
        }
    }

    /// Local derivative `g'(z)` evaluated at the pre-activation `z`.
    ///
    /// For softmax this is only the diagonal of the Jacobian; layers ending in a
    /// softmax use [`softmax_backward`] instead.
    pub fn gradients<T: Scalar, B: Tensor<T>>(&self, z: &B) -> B {
        match *self {
            Activation::Linear => z.map(|_| T::one()),
            Activation::Sigmoid => sigmoid_prime(z),
            Activation::Tanh => z.map(|x| T::one() - x.tanh() * x.tanh()),
            Activation::Relu => relu_prime(z),
            Activation::LeakyRelu(alpha) => {
                let alpha = T::from_f64_lossy(alpha);
                z.map(move |x| if x >= T::zero() { T::one() } else { alpha })
            }
            Activation::Elu(alpha) => {
                let alpha = T::from_f64_lossy(alpha);
                z.map(move |x| if x >= T::zero() { T::one() } else { alpha * x.exp() })
            }
            Activation::Gelu => gelu_prime(z),
            Activation::Softplus => z.map(|x| sigmoid_scalar(x)),
            Activation::Softmax => softmax(z).map(|s| s * (T::one() - s)),
        }
    }

    /// Gradient with respect to `z` given the gradient with respect to `g(z)`.
    pub fn backward<T: Scalar, B: Tensor<T>>(&self, z: &B, activated: &B, upstream: &B) -> Result<B> {
        match self {
            Activation::Linear => Ok(upstream.clone()),
            Activation::Softmax => softmax_backward(activated, upstream),
            _ => upstream.mul(&self.gradients(z)),
        }
    }
}

pub(crate) fn sigmoid_scalar<T: Scalar>(x: T) -> T {
    if x >= T::zero() {
        T::one() / (T::one() + (-x).exp())
    } else {
        let e = x.exp();
        e / (T::one() + e)
    }
}

fn softplus_scalar<T: Scalar>(x: T) -> T {
    // ln(1 + e^x) without overflow for large x
    x.max(T::zero()) + (T::one() + (-x.abs()).exp()).ln()
}

pub fn sigmoid<T: Scalar, B: Tensor<T>>(x: &B) -> B {
    x.map(sigmoid_scalar)
}

pub fn sigmoid_prime<T: Scalar, B: Tensor<T>>(x: &B) -> B {
    x.map(|v| {
        let s = sigmoid_scalar(v);
        s * (T::one() - s)
    })
}

pub fn tanh<T: Scalar, B: Tensor<T>>(x: &B) -> B {
    x.map(|v| v.tanh())
}

pub fn relu<T: Scalar, B: Tensor<T>>(x: &B) -> B {
    x.map(|v| v.max(T::zero()))
}

pub fn relu_prime<T: Scalar, B: Tensor<T>>(x: &B) -> B {
    x.greater_equal(T::zero())
}

pub fn leaky_relu<T: Scalar, B: Tensor<T>>(x: &B, alpha: T) -> B {
    x.map(move |v| if v >= T::zero() { v } else { alpha * v })
}

pub fn elu<T: Scalar, B: Tensor<T>>(x: &B, alpha: T) -> B {
    x.map(move |v| if v >= T::zero() { v } else { alpha * (v.exp() - T::one()) })
}

fn gelu_inner<T: Scalar>(x: T) -> T {
    let c = T::from_f64_lossy((2.0 / std::f64::consts::PI).sqrt());
    c * (x + T::from_f64_lossy(0.044715) * x.powi(3))
}

pub fn gelu<T: Scalar, B: Tensor<T>>(x: &B) -> B {
    let half = T::from_f64_lossy(0.5);
    x.map(move |v| half * v * (T::one() + gelu_inner(v).tanh()))
}

pub fn gelu_prime<T: Scalar, B: Tensor<T>>(x: &B) -> B {
    let half = T::from_f64_lossy(0.5);
    let c = T::from_f64_lossy((2.0 / std::f64::consts::PI).sqrt());
    let k = T::from_f64_lossy(3.0 * 0.044715);
    x.map(move |v| {
        let t = gelu_inner(v).tanh();
        let sech2 = T::one() - t * t;
        half * (T::one() + t) + half * v * sech2 * c * (T::one() + k * v * v)
    })
}

/// Softmax along the last axis, shifted by the row maximum for stability.
pub fn softmax<T: Scalar, B: Tensor<T>>(x: &B) -> B {
    let data = x.get_data();
    if data.ndim() == 0 {
        return x.map(|_| T::one());
    }
    let last_axis = Axis(data.ndim() - 1);
    let mut out = data.clone();
    for mut lane in out.lanes_mut(last_axis) {
        let max = lane
            .iter()
            .filter(|v| !v.is_nan())
            .fold(T::neg_infinity(), |a, &b| a.max(b));
        let max = if max.is_infinite() { T::zero() } else { max };
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        let sum = if sum == T::zero() { T::epsilon() } else { sum };
        lane.mapv_inplace(|v| v / sum);
    }
    B::new(out)
}

/// Jacobian-vector product of the softmax: `s * (g - sum(g * s))` along the last axis.
pub fn softmax_backward<T: Scalar, B: Tensor<T>>(activated: &B, upstream: &B) -> Result<B> {
    if activated.shape() != upstream.shape() {
        return Err(crate::error::NetError::shape(
            "softmax backward",
            &activated.shape(),
            &upstream.shape(),
        ));
    }
    let last_axis = Axis(activated.ndim().saturating_sub(1));
    let mut out = upstream.get_data().clone();
    Zip::from(out.lanes_mut(last_axis))
        .and(activated.get_data().lanes(last_axis))
        .for_each(|mut g, s| {
            let dot = g.iter().zip(s.iter()).fold(T::zero(), |acc, (&a, &b)| acc + a * b);
            Zip::from(&mut g).and(&s).for_each(|gv, &sv| *gv = sv * (*gv - dot));
        });
    Ok(B::new(out))
}
