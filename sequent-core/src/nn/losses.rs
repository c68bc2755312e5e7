use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

use ndarray::{Axis, Zip};
use std::collections::VecDeque;
use std::ops::Add;

/// Loss and gradient of one `(predict, label)` evaluation.
///
/// Values from separate evaluations combine with `+`, which adds the scalar
/// losses and the gradient tensors elementwise.
#[derive(Debug, Clone)]
pub struct LossValue<T, B> {
    pub loss: T,
    pub gradient: B,
}

impl<T: Scalar, B: Tensor<T>> Add for LossValue<T, B> {
    type Output = Result<Self>;

    /// Both gradients must have the same shape.
    fn add(self, other: Self) -> Result<Self> {
        if self.gradient.shape() != other.gradient.shape() {
            return Err(NetError::shape(
                "sum of loss gradients",
                &self.gradient.shape(),
                &other.gradient.shape(),
            ));
        }
        let gradient = self.gradient.add(&other.gradient)?;
        Ok(Self { loss: self.loss + other.loss, gradient })
    }
}

/// The most recent loss evaluations, oldest first, bounded by a capacity.
#[derive(Debug, Clone)]
pub struct LossHistory<T, B> {
    capacity: usize,
    values: VecDeque<LossValue<T, B>>,
}

impl<T: Scalar, B: Tensor<T>> LossHistory<T, B> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, values: VecDeque::with_capacity(capacity) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `value`, evicting the oldest entry once full.
    pub fn record(&mut self, value: LossValue<T, B>) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn last(&self) -> Option<&LossValue<T, B>> {
        self.values.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LossValue<T, B>> {
        self.values.iter()
    }

    pub fn losses(&self) -> Vec<T> {
        self.values.iter().map(|value| value.loss).collect()
    }

    /// Sum of every recorded evaluation, combined with `+`.
    pub fn total(&self) -> Result<Option<LossValue<T, B>>> {
        let mut values = self.values.iter().cloned();
        let Some(first) = values.next() else { return Ok(None) };
        values.try_fold(first, |acc, value| acc + value).map(Some)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

pub trait Loss<T: Scalar, B: Tensor<T>>: Send + Sync {
    fn name(&self) -> &str;

    fn loss(&self, predict: &B, label: &B) -> Result<T>;

    /// Gradient of the loss with respect to `predict`; same shape as `predict`.
    fn gradient(&self, predict: &B, label: &B) -> Result<B>;

    fn evaluate(&self, predict: &B, label: &B) -> Result<LossValue<T, B>> {
        Ok(LossValue { loss: self.loss(predict, label)?, gradient: self.gradient(predict, label)? })
    }
}

fn check_pair<T: Scalar, B: Tensor<T>>(name: &str, predict: &B, label: &B) -> Result<()> {
    if predict.shape() == label.shape() {
        Ok(())
    } else {
        Err(NetError::shape(format!("{} label", name), &predict.shape(), &label.shape()))
    }
}

fn count<T: Scalar, B: Tensor<T>>(tensor: &B) -> T {
    T::from_usize_lossy(tensor.size().max(1))
}

/// Number of independent predictions: every element except the class axis.
fn prediction_count<T: Scalar, B: Tensor<T>>(tensor: &B) -> T {
    let shape = tensor.shape();
    let classes = shape.last().copied().unwrap_or(1).max(1);
    T::from_usize_lossy((tensor.size() / classes).max(1))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl<T: Scalar, B: Tensor<T>> Loss<T, B> for MeanSquaredError {
    fn name(&self) -> &str {
        "mean_squared_error"
    }

    fn loss(&self, predict: &B, label: &B) -> Result<T> {
        check_pair("mean_squared_error", predict, label)?;
        let squared = predict.zip_map(label, |p, l| (p - l) * (p - l))?;
        Ok(squared.sum() / count(predict))
    }

    fn gradient(&self, predict: &B, label: &B) -> Result<B> {
        check_pair("mean_squared_error", predict, label)?;
        let n = count(predict);
        let two = T::from_f64_lossy(2.0);
        predict.zip_map(label, move |p, l| two * (p - l) / n)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl<T: Scalar, B: Tensor<T>> Loss<T, B> for MeanAbsoluteError {
    fn name(&self) -> &str {
        "mean_absolute_error"
    }

    fn loss(&self, predict: &B, label: &B) -> Result<T> {
        check_pair("mean_absolute_error", predict, label)?;
        let absolute = predict.zip_map(label, |p, l| (p - l).abs())?;
        Ok(absolute.sum() / count(predict))
    }

    fn gradient(&self, predict: &B, label: &B) -> Result<B> {
        check_pair("mean_absolute_error", predict, label)?;
        let n = count(predict);
        predict.zip_map(label, move |p, l| {
            let d = p - l;
            if d > T::zero() {
                T::one() / n
            } else if d < T::zero() {
                -T::one() / n
            } else {
                T::zero()
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryCrossEntropy {
    pub epsilon: f64,
}

impl Default for BinaryCrossEntropy {
    fn default() -> Self {
        Self { epsilon: 1e-7 }
    }
}

impl<T: Scalar, B: Tensor<T>> Loss<T, B> for BinaryCrossEntropy {
    fn name(&self) -> &str {
        "binary_cross_entropy"
    }

    fn loss(&self, predict: &B, label: &B) -> Result<T> {
        check_pair("binary_cross_entropy", predict, label)?;
        let eps = T::from_f64_lossy(self.epsilon);
        let terms = predict.zip_map(label, move |p, l| {
            let p = p.max(eps).min(T::one() - eps);
            -(l * p.ln() + (T::one() - l) * (T::one() - p).ln())
        })?;
        Ok(terms.sum() / count(predict))
    }

    fn gradient(&self, predict: &B, label: &B) -> Result<B> {
        check_pair("binary_cross_entropy", predict, label)?;
        let eps = T::from_f64_lossy(self.epsilon);
        let n = count(predict);
        predict.zip_map(label, move |p, l| {
            let p = p.max(eps).min(T::one() - eps);
            (p - l) / (p * (T::one() - p)) / n
        })
    }
}

/// Cross entropy over the last axis. Predictions are renormalised along that
/// axis first, so un-normalised positive scores are accepted.
#[derive(Debug, Clone, Copy)]
pub struct CategoricalCrossEntropy {
    pub epsilon: f64,
}

impl Default for CategoricalCrossEntropy {
    fn default() -> Self {
        Self { epsilon: 1e-7 }
    }
}

impl CategoricalCrossEntropy {
    fn clipped<T: Scalar, B: Tensor<T>>(&self, predict: &B) -> B {
        let eps = T::from_f64_lossy(self.epsilon);
        predict.map(move |p| p.max(eps))
    }
}

impl<T: Scalar, B: Tensor<T>> Loss<T, B> for CategoricalCrossEntropy {
    fn name(&self) -> &str {
        "categorical_cross_entropy"
    }

    fn loss(&self, predict: &B, label: &B) -> Result<T> {
        check_pair("categorical_cross_entropy", predict, label)?;
        let clipped = self.clipped(predict);
        let axis = Axis(clipped.ndim().saturating_sub(1));
        let mut total = T::zero();
        Zip::from(clipped.get_data().lanes(axis))
            .and(label.get_data().lanes(axis))
            .for_each(|p, l| {
                let sum = p.sum();
                total += p.iter().zip(l.iter()).fold(T::zero(), |acc, (&pv, &lv)| acc - lv * (pv / sum).ln());
            });
        Ok(total / prediction_count(predict))
    }

    fn gradient(&self, predict: &B, label: &B) -> Result<B> {
        check_pair("categorical_cross_entropy", predict, label)?;
        let eps = T::from_f64_lossy(self.epsilon);
        let clipped = self.clipped(predict);
        let n = prediction_count(predict);
        let axis = Axis(clipped.ndim().saturating_sub(1));
        let mut grad = clipped.get_data().clone();
        Zip::from(grad.lanes_mut(axis))
            .and(predict.get_data().lanes(axis))
            .and(label.get_data().lanes(axis))
            .for_each(|mut g, p, l| {
                let sum = g.sum();
                let label_sum = l.sum();
                Zip::from(&mut g).and(&p).and(&l).for_each(|gv, &pv, &lv| {
                    // d/dp of -l*ln(p/S); zero where the clipping is active
                    *gv = if pv >= eps { (label_sum / sum - lv / *gv) / n } else { T::zero() };
                });
            });
        Ok(B::new(grad))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KlDivergence {
    pub epsilon: f64,
}

impl Default for KlDivergence {
    fn default() -> Self {
        Self { epsilon: 1e-7 }
    }
}

impl<T: Scalar, B: Tensor<T>> Loss<T, B> for KlDivergence {
    fn name(&self) -> &str {
        "kl_divergence"
    }

    fn loss(&self, predict: &B, label: &B) -> Result<T> {
        check_pair("kl_divergence", predict, label)?;
        let eps = T::from_f64_lossy(self.epsilon);
        let terms = predict.zip_map(label, move |p, l| {
            let p = p.max(eps).min(T::one());
            let l = l.max(eps).min(T::one());
            l * (l / p).ln()
        })?;
        Ok(terms.sum() / prediction_count(predict))
    }

    fn gradient(&self, predict: &B, label: &B) -> Result<B> {
        check_pair("kl_divergence", predict, label)?;
        let eps = T::from_f64_lossy(self.epsilon);
        let n = prediction_count(predict);
        predict.zip_map(label, move |p, l| {
            if p < eps || p > T::one() {
                return T::zero();
            }
            let l = l.max(eps).min(T::one());
            -l / p / n
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use ndarray::array;

    fn t(data: ndarray::ArrayD<f64>) -> CpuTensor<f64> {
        CpuTensor::new(data)
    }

    fn numeric_gradient(loss: &dyn Loss<f64, CpuTensor<f64>>, predict: &CpuTensor<f64>, label: &CpuTensor<f64>) -> Vec<f64> {
        let eps = 1e-6;
        let mut out = Vec::new();
        for i in 0..predict.size() {
            let mut plus = predict.clone();
            if let Some(v) = plus.iter_mut().nth(i) {
                *v += eps;
            }
            let mut minus = predict.clone();
            if let Some(v) = minus.iter_mut().nth(i) {
                *v -= eps;
            }
            let lp = loss.loss(&plus, label).unwrap();
            let lm = loss.loss(&minus, label).unwrap();
            out.push((lp - lm) / (2.0 * eps));
        }
        out
    }

    #[test]
    fn test_mse_value_and_gradient() {
        let p = t(array![[1.0, 2.0], [3.0, 4.0]].into_dyn());
        let l = t(array![[1.0, 0.0], [3.0, 6.0]].into_dyn());
        let mse = MeanSquaredError;
        assert!((Loss::<f64, CpuTensor<f64>>::loss(&mse, &p, &l).unwrap() - 2.0).abs() < 1e-12);
        let g = Loss::<f64, CpuTensor<f64>>::gradient(&mse, &p, &l).unwrap();
        assert_eq!(g.get_data(), &array![[0.0, 1.0], [0.0, -1.0]].into_dyn());
    }

    #[test]
    fn test_shape_mismatch_is_invalid_argument() {
        let p = t(array![[1.0, 2.0]].into_dyn());
        let l = t(array![[1.0], [2.0]].into_dyn());
        let err = Loss::<f64, CpuTensor<f64>>::loss(&MeanSquaredError, &p, &l).unwrap_err();
        assert!(matches!(err, NetError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_binary_cross_entropy_bounds() {
        let bce = BinaryCrossEntropy::default();
        let exact = t(array![[1.0, 0.0, 1.0]].into_dyn());
        let perfect = Loss::<f64, CpuTensor<f64>>::loss(&bce, &exact, &exact).unwrap();
        assert!(perfect < 1e-6);

        let wrong = t(array![[0.0, 1.0, 0.0]].into_dyn());
        let worst = Loss::<f64, CpuTensor<f64>>::loss(&bce, &wrong, &exact).unwrap();
        let bound = -(1e-7f64).ln();
        assert!((worst - bound).abs() < 1e-3);
        assert!(worst.is_finite());
    }

    #[test]
    fn test_mae_subgradient_at_zero() {
        let p = t(array![1.0, 2.0, 3.0].into_dyn());
        let l = t(array![1.0, 0.0, 5.0].into_dyn());
        let g = Loss::<f64, CpuTensor<f64>>::gradient(&MeanAbsoluteError, &p, &l).unwrap();
        assert_eq!(g.get_data(), &array![0.0, 1.0 / 3.0, -1.0 / 3.0].into_dyn());
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let p = t(array![[0.2, 0.5, 0.3], [0.1, 0.1, 0.8]].into_dyn());
        let l = t(array![[0.0, 1.0, 0.0], [0.3, 0.3, 0.4]].into_dyn());
        let losses: Vec<Box<dyn Loss<f64, CpuTensor<f64>>>> = vec![
            Box::new(MeanSquaredError),
            Box::new(BinaryCrossEntropy::default()),
            Box::new(CategoricalCrossEntropy::default()),
            Box::new(KlDivergence::default()),
        ];
        for loss in &losses {
            let analytic = loss.gradient(&p, &l).unwrap();
            let numeric = numeric_gradient(loss.as_ref(), &p, &l);
            for (a, n) in analytic.iter().zip(numeric.iter()) {
                assert!((a - n).abs() < 1e-5, "{}: {} vs {}", loss.name(), a, n);
            }
        }
    }

    #[test]
    fn test_categorical_cross_entropy_counts_predictions() {
        let p = t(array![[[0.5, 0.5], [0.25, 0.75]]].into_dyn());
        let l = t(array![[[1.0, 0.0], [0.0, 1.0]]].into_dyn());
        let value = Loss::<f64, CpuTensor<f64>>::loss(&CategoricalCrossEntropy::default(), &p, &l).unwrap();
        let expected = -(0.5f64.ln() + 0.75f64.ln()) / 2.0;
        assert!((value - expected).abs() < 1e-9);
    }

    #[test]
    fn test_loss_values_add() {
        let a = LossValue { loss: 1.5, gradient: t(array![1.0, 2.0].into_dyn()) };
        let b = LossValue { loss: 0.5, gradient: t(array![0.5, -1.0].into_dyn()) };
        let sum = (a + b).unwrap();
        assert_eq!(sum.loss, 2.0);
        assert_eq!(sum.gradient.get_data(), &array![1.5, 1.0].into_dyn());

        let c = LossValue { loss: 2.0, gradient: t(array![5.0, 5.0, 5.0].into_dyn()) };
        assert!(matches!(sum + c, Err(NetError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_history_keeps_the_latest_values() {
        let mut history = LossHistory::<f64, CpuTensor<f64>>::new(2);
        for (loss, g) in [(3.0, 1.0), (2.0, 0.5), (1.0, 0.25)] {
            history.record(LossValue { loss, gradient: t(array![g, -g].into_dyn()) });
        }
        assert_eq!(history.losses(), vec![2.0, 1.0]);
        assert_eq!(history.last().unwrap().loss, 1.0);

        let total = history.total().unwrap().unwrap();
        assert_eq!(total.loss, 3.0);
        assert_eq!(total.gradient.get_data(), &array![0.75, -0.75].into_dyn());

        history.record(LossValue { loss: 0.5, gradient: t(array![1.0].into_dyn()) });
        assert!(matches!(history.total(), Err(NetError::ShapeMismatch { .. })));

        let mut disabled = LossHistory::<f64, CpuTensor<f64>>::new(0);
        disabled.record(LossValue { loss: 1.0, gradient: t(array![1.0].into_dyn()) });
        assert!(disabled.is_empty());
        assert!(disabled.total().unwrap().is_none());
    }
}
