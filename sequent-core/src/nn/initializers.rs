use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

use ndarray::{Array, IxDyn};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Weight initialisation schemes, parameterised by fan-in / fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Zeros,
    Ones,
    Constant(f64),
    RandomUniform { min: f64, max: f64 },
    RandomNormal { mean: f64, std: f64 },
    GlorotUniform,
    GlorotNormal,
    HeUniform,
    HeNormal,
    LecunUniform,
    LecunNormal,
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::GlorotUniform
    }
}

impl Initializer {
    /// Rejects parameters no distribution can be built from.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Initializer::Constant(value) if !value.is_finite() => {
                Err(NetError::invalid(format!("constant initializer needs a finite value, got {}", value)))
            }
            Initializer::RandomUniform { min, max } if !(min.is_finite() && max.is_finite() && min < max) => {
                Err(NetError::invalid(format!("uniform initializer needs finite min < max, got [{}, {})", min, max)))
            }
            Initializer::RandomNormal { mean, std } if !(mean.is_finite() && std.is_finite() && std >= 0.0) => {
                Err(NetError::invalid(format!(
                    "normal initializer needs a finite mean and std >= 0, got mean {} std {}",
                    mean, std
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn sample<T, B, R>(&self, shape: &[usize], fan_in: usize, fan_out: usize, rng: &mut R) -> Result<B>
    where
        T: Scalar,
        B: Tensor<T>,
        R: Rng + ?Sized,
    {
        self.validate()?;
        Ok(self.draw(shape, fan_in, fan_out, rng))
    }

    /// Draws without validating; only for schemes whose parameters are known good.
    pub(crate) fn draw<T, B, R>(&self, shape: &[usize], fan_in: usize, fan_out: usize, rng: &mut R) -> B
    where
        T: Scalar,
        B: Tensor<T>,
        R: Rng + ?Sized,
    {
        let fan_in = fan_in.max(1) as f64;
        let fan_out = fan_out.max(1) as f64;

        match *self {
            Initializer::Zeros => B::zeros(shape),
            Initializer::Ones => B::ones(shape),
            Initializer::Constant(value) => B::full(shape, T::from_f64_lossy(value)),
            Initializer::RandomUniform { min, max } => uniform(shape, min, max, rng),
            Initializer::RandomNormal { mean, std } => normal(shape, mean, std, rng),
            Initializer::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                uniform(shape, -limit, limit, rng)
            }
            Initializer::GlorotNormal => normal(shape, 0.0, (2.0 / (fan_in + fan_out)).sqrt(), rng),
            Initializer::HeUniform => {
                let limit = (6.0 / fan_in).sqrt();
                uniform(shape, -limit, limit, rng)
            }
            Initializer::HeNormal => normal(shape, 0.0, (2.0 / fan_in).sqrt(), rng),
            Initializer::LecunUniform => {
                let limit = (3.0 / fan_in).sqrt();
                uniform(shape, -limit, limit, rng)
            }
            Initializer::LecunNormal => normal(shape, 0.0, (1.0 / fan_in).sqrt(), rng),
        }
    }
}

fn uniform<T, B, R>(shape: &[usize], min: f64, max: f64, rng: &mut R) -> B
where
    T: Scalar,
    B: Tensor<T>,
    R: Rng + ?Sized,
{
    if !(min < max) {
        return B::full(shape, T::from_f64_lossy(min));
    }
    let dist = Uniform::new(min, max);
    let data = Array::from_shape_fn(IxDyn(shape), |_| T::from_f64_lossy(dist.sample(rng)));
    B::new(data)
}

fn normal<T, B, R>(shape: &[usize], mean: f64, std: f64, rng: &mut R) -> B
where
    T: Scalar,
    B: Tensor<T>,
    R: Rng + ?Sized,
{
    let data = Array::from_shape_fn(IxDyn(shape), |_| {
        let z: f64 = StandardNormal.sample(rng);
        T::from_f64_lossy(mean + std * z)
    });
    B::new(data)
}
