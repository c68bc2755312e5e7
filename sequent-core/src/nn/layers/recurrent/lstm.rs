use super::{bias_tensor, matrix, output_gradient, output_shape, sequence, sigmoid, tanh, to_tensor, vector, Recurrent};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::initializers::Initializer;
use crate::nn::layers::{check_gradient, Layer, Param};

use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::Rng;

/// Everything the backward pass needs from one timestep.
struct LstmStep<T> {
    x: Array2<T>,
    h_prev: Array2<T>,
    c_prev: Array2<T>,
    input_gate: Array2<T>,
    forget_gate: Array2<T>,
    candidate: Array2<T>,
    output_gate: Array2<T>,
    tanh_c: Array2<T>,
}

/// Long short-term memory layer.
///
/// Gates are packed `[input | forget | candidate | output]` along the columns
/// of a `(features, 4·units)` kernel, a `(units, 4·units)` recurrent kernel
/// and a `(4·units)` bias, so each step costs two matrix products.
pub struct Lstm<T, B> {
    name: String,
    input_dim: usize,
    units: usize,
    return_sequences: bool,
    kernel: Param<T, B>,
    recurrent: Param<T, B>,
    bias: Param<T, B>,
    steps: Vec<LstmStep<T>>,
    output: Option<B>,
    input_grad: Option<B>,
}

impl<T: Scalar, B: Tensor<T>> Lstm<T, B> {
    pub fn new(input_dim: usize, units: usize) -> Self {
        Self::with_rng(input_dim, units, &mut rand::thread_rng())
    }

    /// The forget-gate slice of the bias starts at one.
    pub fn with_rng<R: Rng + ?Sized>(input_dim: usize, units: usize, rng: &mut R) -> Self {
        let kernel = Initializer::GlorotUniform.draw(&[input_dim, 4 * units], input_dim, 4 * units, rng);
        let recurrent = Initializer::GlorotUniform.draw(&[units, 4 * units], units, 4 * units, rng);
        let bias = Array1::from_shape_fn(4 * units, |i| if (units..2 * units).contains(&i) { T::one() } else { T::zero() });
        Self::build(kernel, recurrent, bias_tensor(bias))
    }

    pub fn from_weights(kernel: B, recurrent: B, bias: B) -> Result<Self> {
        let k = kernel.shape();
        if k.len() != 2 || k[1] % 4 != 0 {
            return Err(NetError::invalid(format!("lstm kernel must be (features, 4·units), got {:?}", k)));
        }
        let units = k[1] / 4;
        if recurrent.shape() != [units, 4 * units] {
            return Err(NetError::shape("lstm recurrent kernel", &[units, 4 * units], &recurrent.shape()));
        }
        if bias.shape() != [4 * units] {
            return Err(NetError::shape("lstm bias", &[4 * units], &bias.shape()));
        }
        Ok(Self::build(kernel, recurrent, bias))
    }

    fn build(kernel: B, recurrent: B, bias: B) -> Self {
        let shape = kernel.shape();
        Self {
            name: "lstm".to_string(),
            input_dim: shape[0],
            units: shape[1] / 4,
            return_sequences: false,
            kernel: Param::new("kernel", kernel),
            recurrent: Param::new("recurrent_kernel", recurrent),
            bias: Param::new("bias", bias),
            steps: Vec::new(),
            output: None,
            input_grad: None,
        }
    }

    pub fn with_return_sequences(mut self, return_sequences: bool) -> Self {
        self.return_sequences = return_sequences;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kernel(&self) -> &B {
        &self.kernel.value
    }

    pub fn recurrent_kernel(&self) -> &B {
        &self.recurrent.value
    }

    pub fn bias(&self) -> &B {
        &self.bias.value
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for Lstm<T, B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        let x = sequence(&self.name, input, self.input_dim)?;
        let (batch, steps, _) = x.dim();
        let u = self.units;
        let w = matrix(&self.kernel.value)?;
        let r = matrix(&self.recurrent.value)?;
        let b = vector(&self.bias.value)?;
        debug_assert_eq!(w.ncols(), 4 * u);
        debug_assert_eq!(r.dim(), (u, 4 * u));

        let mut h = Array2::<T>::zeros((batch, u));
        let mut c = Array2::<T>::zeros((batch, u));
        let mut records = Vec::with_capacity(steps);
        let mut outputs = Vec::with_capacity(steps);

        for t in 0..steps {
            let xt = x.index_axis(Axis(1), t).to_owned();
            let a = xt.dot(&w) + h.dot(&r) + &b;

            let input_gate = sigmoid(a.slice(s![.., 0..u]));
            let forget_gate = sigmoid(a.slice(s![.., u..2 * u]));
            let candidate = tanh(a.slice(s![.., 2 * u..3 * u]));
            let output_gate = sigmoid(a.slice(s![.., 3 * u..4 * u]));

            let c_next = &forget_gate * &c + &input_gate * &candidate;
            let tanh_c = c_next.mapv(|v| v.tanh());
            let h_next = &output_gate * &tanh_c;

            records.push(LstmStep {
                x: xt,
                h_prev: std::mem::replace(&mut h, h_next),
                c_prev: std::mem::replace(&mut c, c_next),
                input_gate,
                forget_gate,
                candidate,
                output_gate,
                tanh_c,
            });
            if self.return_sequences {
                outputs.push(h.clone());
            }
        }

        let output = if self.return_sequences {
            let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
            B::new(ndarray::stack(Axis(1), &views).map_err(|e| NetError::invalid(e.to_string()))?.into_dyn())
        } else {
            to_tensor(h)
        };
        self.steps = records;
        self.output = Some(output);
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let output = self.output.as_ref().ok_or_else(|| NetError::not_forwarded(&self.name))?;
        check_gradient(&self.name, &output.shape(), &gradient.shape())?;

        let u = self.units;
        let steps = self.steps.len();
        let batch = output.shape()[0];
        let w = matrix(&self.kernel.value)?;
        let r = matrix(&self.recurrent.value)?;
        let dy = gradient.get_data().view();

        let mut dw = Array2::<T>::zeros(w.raw_dim());
        let mut dr = Array2::<T>::zeros(r.raw_dim());
        let mut db = Array1::<T>::zeros(4 * u);
        let mut dx = Array3::<T>::zeros((batch, steps, self.input_dim));
        let mut dh_next = Array2::<T>::zeros((batch, u));
        let mut dc_next = Array2::<T>::zeros((batch, u));
        let one = T::one();

        for t in (0..steps).rev() {
            let step = &self.steps[t];
            let mut dh = dh_next;
            if let Some(g) = output_gradient(&dy, self.return_sequences, t, steps) {
                dh = dh + g;
            }

            let d_output = &dh * &step.tanh_c;
            let dc = dc_next + &dh * &step.output_gate * &step.tanh_c.mapv(|v| one - v * v);
            let d_input = &dc * &step.candidate;
            let d_candidate = &dc * &step.input_gate;
            let d_forget = &dc * &step.c_prev;
            dc_next = &dc * &step.forget_gate;

            let mut da = Array2::<T>::zeros((batch, 4 * u));
            da.slice_mut(s![.., 0..u])
                .assign(&(d_input * &step.input_gate.mapv(|v| v * (one - v))));
            da.slice_mut(s![.., u..2 * u])
                .assign(&(d_forget * &step.forget_gate.mapv(|v| v * (one - v))));
            da.slice_mut(s![.., 2 * u..3 * u])
                .assign(&(d_candidate * &step.candidate.mapv(|v| one - v * v)));
            da.slice_mut(s![.., 3 * u..4 * u])
                .assign(&(d_output * &step.output_gate.mapv(|v| v * (one - v))));

            dw = dw + step.x.t().dot(&da);
            dr = dr + step.h_prev.t().dot(&da);
            db = db + da.sum_axis(Axis(0));
            dx.index_axis_mut(Axis(1), t).assign(&da.dot(&w.t()));
            dh_next = da.dot(&r.t());
        }

        self.kernel.grad = to_tensor(dw);
        self.recurrent.grad = to_tensor(dr);
        self.bias.grad = bias_tensor(db);
        self.input_grad = Some(B::new(dx.into_dyn()));
        Ok(())
    }

    fn output(&self) -> Option<&B> {
        self.output.as_ref()
    }

    fn input_gradient(&self) -> Option<&B> {
        self.input_grad.as_ref()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        output_shape(&self.name, input_shape, self.input_dim, self.units, self.return_sequences)
    }

    fn parameters(&self) -> Vec<&Param<T, B>> {
        vec![&self.kernel, &self.recurrent, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param<T, B>> {
        vec![&mut self.kernel, &mut self.recurrent, &mut self.bias]
    }
}

impl<T: Scalar, B: Tensor<T>> Recurrent<T, B> for Lstm<T, B> {
    fn units(&self) -> usize {
        self.units
    }

    fn return_sequences(&self) -> bool {
        self.return_sequences
    }

    fn twin(&self) -> Self {
        Self::new(self.input_dim, self.units)
            .with_return_sequences(self.return_sequences)
            .named(format!("{}_twin", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use crate::nn::losses::MeanSquaredError;
    use crate::nn::optimizers::Sgd;
    use crate::nn::sequential::Sequential;
    use ndarray::Array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random(shape: (usize, usize, usize), rng: &mut StdRng) -> CpuTensor<f64> {
        CpuTensor::new(Array::from_shape_fn(shape, |_| rng.gen_range(-1.0..1.0)).into_dyn())
    }

    #[test]
    fn test_output_shapes() {
        let mut lstm = Lstm::<f64, CpuTensor<f64>>::new(3, 5);
        let x = CpuTensor::<f64>::random(&[2, 4, 3]);
        lstm.forward(&x).unwrap();
        assert_eq!(lstm.output().unwrap().shape(), vec![2, 5]);

        let mut lstm = lstm.with_return_sequences(true);
        lstm.forward(&x).unwrap();
        assert_eq!(lstm.output().unwrap().shape(), vec![2, 4, 5]);
        assert_eq!(lstm.parameter_count(), 3 * 20 + 5 * 20 + 20);
    }

    #[test]
    fn test_single_step_matches_gate_equations() {
        // one unit, identity-like weights: every gate sees the same pre-activation
        let kernel = CpuTensor::new(Array::from_elem((1, 4), 0.5).into_dyn());
        let recurrent = CpuTensor::zeros(&[1, 4]);
        let bias = CpuTensor::zeros(&[4]);
        let mut lstm = Lstm::<f64, CpuTensor<f64>>::from_weights(kernel, recurrent, bias).unwrap();
        lstm.forward(&CpuTensor::full(&[1, 1, 1], 2.0)).unwrap();

        let sig = 1.0 / (1.0 + (-1.0f64).exp());
        let c = sig * 1.0f64.tanh();
        let expected = sig * c.tanh();
        assert!((lstm.output().unwrap().get_data()[[0, 0]] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_forget_bias_starts_at_one() {
        let lstm = Lstm::<f32, CpuTensor<f32>>::with_rng(2, 3, &mut StdRng::seed_from_u64(0));
        let bias: Vec<f32> = lstm.bias().iter().copied().collect();
        assert_eq!(bias, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_lstm_gradient_check() {
        for return_sequences in [false, true] {
            let mut rng = StdRng::seed_from_u64(3);
            let lstm = Lstm::<f64, CpuTensor<f64>>::with_rng(3, 4, &mut rng).with_return_sequences(return_sequences);
            let mut model = Sequential::<f64, CpuTensor<f64>>::new();
            model.add(lstm);
            model.compile(MeanSquaredError, Sgd::default());

            let x = random((2, 5, 3), &mut rng);
            let y = if return_sequences {
                random((2, 5, 4), &mut rng)
            } else {
                CpuTensor::new(Array::from_shape_fn((2, 4), |_| rng.gen_range(-1.0..1.0)).into_dyn())
            };
            let error = model.gradient_check(&x, &y, 1e-6).unwrap();
            assert!(error < 1e-6, "return_sequences={} relative error {}", return_sequences, error);
        }
    }
}
