use super::{bias_tensor, matrix, output_gradient, output_shape, sequence, sigmoid, tanh, to_tensor, vector, Recurrent};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::initializers::Initializer;
use crate::nn::layers::{check_gradient, Layer, Param};

use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::Rng;

struct GruStep<T> {
    x: Array2<T>,
    h_prev: Array2<T>,
    update: Array2<T>,
    reset: Array2<T>,
    candidate: Array2<T>,
    /// `reset ⊙ h_prev`, the input of the candidate's recurrent product.
    reset_state: Array2<T>,
}

/// Gated recurrent unit with the reset gate applied before the recurrent
/// product of the candidate state:
///
/// ```text
/// z  = σ(x·W_z + h·U_z + b_z)
/// r  = σ(x·W_r + h·U_r + b_r)
/// h̃  = tanh(x·W_h + (r ⊙ h)·U_h + b_h)
/// h' = z ⊙ h + (1 - z) ⊙ h̃
/// ```
///
/// Gates are packed `[update | reset | candidate]` along the columns.
pub struct Gru<T, B> {
    name: String,
    input_dim: usize,
    units: usize,
    return_sequences: bool,
    kernel: Param<T, B>,
    recurrent: Param<T, B>,
    bias: Param<T, B>,
    steps: Vec<GruStep<T>>,
    output: Option<B>,
    input_grad: Option<B>,
}

impl<T: Scalar, B: Tensor<T>> Gru<T, B> {
    pub fn new(input_dim: usize, units: usize) -> Self {
        Self::with_rng(input_dim, units, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(input_dim: usize, units: usize, rng: &mut R) -> Self {
        let kernel = Initializer::GlorotUniform.draw(&[input_dim, 3 * units], input_dim, 3 * units, rng);
        let recurrent = Initializer::GlorotUniform.draw(&[units, 3 * units], units, 3 * units, rng);
        Self::build(kernel, recurrent, B::zeros(&[3 * units]))
    }

    pub fn from_weights(kernel: B, recurrent: B, bias: B) -> Result<Self> {
        let k = kernel.shape();
        if k.len() != 2 || k[1] % 3 != 0 {
            return Err(NetError::invalid(format!("gru kernel must be (features, 3·units), got {:?}", k)));
        }
        let units = k[1] / 3;
        if recurrent.shape() != [units, 3 * units] {
            return Err(NetError::shape("gru recurrent kernel", &[units, 3 * units], &recurrent.shape()));
        }
        if bias.shape() != [3 * units] {
            return Err(NetError::shape("gru bias", &[3 * units], &bias.shape()));
        }
        Ok(Self::build(kernel, recurrent, bias))
    }

    fn build(kernel: B, recurrent: B, bias: B) -> Self {
        let shape = kernel.shape();
        Self {
            name: "gru".to_string(),
            input_dim: shape[0],
            units: shape[1] / 3,
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
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for Gru<T, B> {
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
        debug_assert_eq!(w.ncols(), 3 * u);
        debug_assert_eq!(r.dim(), (u, 3 * u));
        let r_gates = r.slice(s![.., 0..2 * u]);
        let r_candidate = r.slice(s![.., 2 * u..3 * u]);

        let mut h = Array2::<T>::zeros((batch, u));
        let mut records = Vec::with_capacity(steps);
        let mut outputs = Vec::with_capacity(steps);

        for t in 0..steps {
            let xt = x.index_axis(Axis(1), t).to_owned();
            let ax = xt.dot(&w) + &b;
            let ah = h.dot(&r_gates);

            let update = sigmoid((&ax.slice(s![.., 0..u]) + &ah.slice(s![.., 0..u])).view());
            let reset = sigmoid((&ax.slice(s![.., u..2 * u]) + &ah.slice(s![.., u..2 * u])).view());
            let reset_state = &reset * &h;
            let candidate = tanh((&ax.slice(s![.., 2 * u..3 * u]) + &reset_state.dot(&r_candidate)).view());

            let one = T::one();
            let h_next = &update * &h + &update.mapv(|z| one - z) * &candidate;
            records.push(GruStep {
                x: xt,
                h_prev: std::mem::replace(&mut h, h_next),
                update,
                reset,
                candidate,
                reset_state,
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
        let r_gates = r.slice(s![.., 0..2 * u]);
        let r_candidate = r.slice(s![.., 2 * u..3 * u]);
        let dy = gradient.get_data().view();

        let mut dw = Array2::<T>::zeros(w.raw_dim());
        let mut dr = Array2::<T>::zeros(r.raw_dim());
        let mut db = Array1::<T>::zeros(3 * u);
        let mut dx = Array3::<T>::zeros((batch, steps, self.input_dim));
        let mut dh_next = Array2::<T>::zeros((batch, u));
        let one = T::one();

        for t in (0..steps).rev() {
            let step = &self.steps[t];
            let mut dh = dh_next;
            if let Some(g) = output_gradient(&dy, self.return_sequences, t, steps) {
                dh = dh + g;
            }

            let d_candidate = &dh * &step.update.mapv(|z| one - z);
            let d_update = &dh * &(&step.h_prev - &step.candidate);
            let mut dh_prev = &dh * &step.update;

            let da_candidate = d_candidate * &step.candidate.mapv(|v| one - v * v);
            let d_reset_state = da_candidate.dot(&r_candidate.t());
            let d_reset = &d_reset_state * &step.h_prev;
            dh_prev = dh_prev + &d_reset_state * &step.reset;

            let mut da = Array2::<T>::zeros((batch, 3 * u));
            da.slice_mut(s![.., 0..u])
                .assign(&(d_update * &step.update.mapv(|z| z * (one - z))));
            da.slice_mut(s![.., u..2 * u])
                .assign(&(d_reset * &step.reset.mapv(|v| v * (one - v))));
            da.slice_mut(s![.., 2 * u..3 * u]).assign(&da_candidate);
            let da_gates = da.slice(s![.., 0..2 * u]);

            dw = dw + step.x.t().dot(&da);
            db = db + da.sum_axis(Axis(0));
            {
                let mut gates = dr.slice_mut(s![.., 0..2 * u]);
                gates += &step.h_prev.t().dot(&da_gates);
            }
            {
                let mut cand = dr.slice_mut(s![.., 2 * u..3 * u]);
                cand += &step.reset_state.t().dot(&da_candidate);
            }
            dh_prev = dh_prev + da_gates.dot(&r_gates.t());
            dx.index_axis_mut(Axis(1), t).assign(&da.dot(&w.t()));
            dh_next = dh_prev;
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

impl<T: Scalar, B: Tensor<T>> Recurrent<T, B> for Gru<T, B> {
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

    #[test]
    fn test_zero_update_gate_takes_candidate() {
        // a large negative update bias closes z, so h' ≈ h̃ = tanh(x·W_h)
        let kernel = CpuTensor::new(Array::from_elem((1, 3), 0.3).into_dyn());
        let recurrent = CpuTensor::zeros(&[1, 3]);
        let bias = CpuTensor::new(ndarray::array![-50.0, 0.0, 0.0].into_dyn());
        let mut gru = Gru::<f64, CpuTensor<f64>>::from_weights(kernel, recurrent, bias).unwrap();
        gru.forward(&CpuTensor::full(&[1, 1, 1], 1.0)).unwrap();
        assert!((gru.output().unwrap().get_data()[[0, 0]] - 0.3f64.tanh()).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_wrong_feature_count() {
        let mut gru = Gru::<f32, CpuTensor<f32>>::new(4, 2);
        assert!(matches!(gru.forward(&CpuTensor::zeros(&[1, 3, 5])), Err(NetError::ShapeMismatch { .. })));
        assert!(gru.output_shape(&[1, 3]).is_err());
    }

    #[test]
    fn test_gru_gradient_check() {
        for return_sequences in [false, true] {
            let mut rng = StdRng::seed_from_u64(12);
            let gru = Gru::<f64, CpuTensor<f64>>::with_rng(2, 3, &mut rng).with_return_sequences(return_sequences);
            let mut model = Sequential::<f64, CpuTensor<f64>>::new();
            model.add(gru);
            model.compile(MeanSquaredError, Sgd::default());

            let x = CpuTensor::new(Array::from_shape_fn((3, 4, 2), |_| rng.gen_range(-1.0..1.0)).into_dyn());
            let y_shape: Vec<usize> = if return_sequences { vec![3, 4, 3] } else { vec![3, 3] };
            let y = CpuTensor::new(
                Array::from_shape_fn(ndarray::IxDyn(&y_shape), |_| rng.gen_range(-1.0..1.0)),
            );
            let error = model.gradient_check(&x, &y, 1e-6).unwrap();
            assert!(error < 1e-6, "return_sequences={} relative error {}", return_sequences, error);
        }
    }
}
