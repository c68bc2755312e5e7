//! A linear stack of layers trained one pre-batched sample at a time.
//!
//! The model owns its layers, the bound loss and optimizer, and a single
//! rayon pool that every data-parallel tensor operation of a `fit`,
//! `predict`, `evaluate` or `gradient_check` call runs on.

use crate::backends::{Scalar, Tensor};
use crate::config::TrainConfig;
use crate::error::{NetError, Result};
use crate::io;
use crate::nn::layers::{Layer, ParamId};
use crate::nn::losses::{Loss, LossHistory, LossValue};
use crate::nn::optimizers::Optimizer;
use crate::utils::ProgressBar;

use log::{debug, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a [`Sequential::fit`] call.
#[derive(Debug, Clone, Default)]
pub struct History<T> {
    /// Mean training loss of every epoch, in order.
    pub losses: Vec<T>,
    pub elapsed: Duration,
}

impl<T: Scalar> History<T> {
    pub fn final_loss(&self) -> Option<T> {
        self.losses.last().copied()
    }
}

/// Applies the configured gradient guards before handing a parameter to the
/// bound optimizer.
struct GuardedOptimizer<'a, T, B> {
    inner: &'a mut dyn Optimizer<T, B>,
    clip_norm: Option<T>,
    skip_non_finite: bool,
}

impl<'a, T: Scalar, B: Tensor<T>> Optimizer<T, B> for GuardedOptimizer<'a, T, B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn minimize(&mut self, id: ParamId, param: &mut B, grad: &B) -> Result<()> {
        if self.skip_non_finite && !grad.is_finite() {
            warn!("skipping update of parameter {}: gradient is not finite", id);
            return Ok(());
        }
        if let Some(max_norm) = self.clip_norm {
            let norm = grad.norm();
            if norm > max_norm {
                warn!("clipping gradient of parameter {} from norm {} to {}", id, norm, max_norm);
                let clipped = grad.mul_scalar(max_norm / norm);
                return self.inner.minimize(id, param, &clipped);
            }
        }
        self.inner.minimize(id, param, grad)
    }

    fn step(&mut self) {
        self.inner.step();
    }

    fn learning_rate(&self) -> T {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: T) {
        self.inner.set_learning_rate(learning_rate);
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Runs every layer in order, each one fed by the cached output of the previous.
fn forward_chain<T: Scalar, B: Tensor<T>>(layers: &mut [Box<dyn Layer<T, B>>], input: &B) -> Result<()> {
    let first = layers.first_mut().ok_or_else(|| NetError::invalid("model has no layers"))?;
    first.forward(input)?;
    for i in 1..layers.len() {
        let (done, todo) = layers.split_at_mut(i);
        todo[0].forward_from(done[i - 1].as_ref())?;
    }
    Ok(())
}

fn last_output<T: Scalar, B: Tensor<T>>(layers: &[Box<dyn Layer<T, B>>]) -> Result<&B> {
    let last = layers.last().ok_or_else(|| NetError::invalid("model has no layers"))?;
    last.output().ok_or_else(|| NetError::not_forwarded(last.name()))
}

/// Overwrites element `k` of parameter `index` and returns the previous value.
fn replace_element<T: Scalar, B: Tensor<T>>(layer: &mut dyn Layer<T, B>, index: usize, k: usize, value: T) -> Option<T> {
    let param = layer.parameters_mut().into_iter().nth(index)?;
    let slot = param.value.iter_mut().nth(k)?;
    Some(std::mem::replace(slot, value))
}

pub struct Sequential<T: Scalar, B: Tensor<T>> {
    layers: Vec<Box<dyn Layer<T, B>>>,
    loss: Option<Box<dyn Loss<T, B>>>,
    optimizer: Option<Box<dyn Optimizer<T, B>>>,
    history: LossHistory<T, B>,
    config: TrainConfig,
    pool: Option<Arc<ThreadPool>>,
    training: bool,
    cancel: Arc<AtomicBool>,
}

impl<T: Scalar, B: Tensor<T>> Default for Sequential<T, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar, B: Tensor<T>> Sequential<T, B> {
    pub fn new() -> Self {
        Self::with_config(TrainConfig::default())
    }

    pub fn with_config(config: TrainConfig) -> Self {
        Self {
            layers: Vec::new(),
            loss: None,
            optimizer: None,
            history: LossHistory::new(config.history_len),
            config,
            pool: None,
            training: true,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Appends a layer; it inherits the model's current training mode.
    pub fn add<L: Layer<T, B> + 'static>(&mut self, mut layer: L) -> &mut Self {
        debug!("adding layer #{} '{}'", self.layers.len(), layer.name());
        layer.set_training(self.training);
        self.layers.push(Box::new(layer));
        self
    }

    /// Binds the loss and optimizer used by `backward`, `update` and `fit`.
    pub fn compile<L, O>(&mut self, loss: L, optimizer: O) -> &mut Self
    where
        L: Loss<T, B> + 'static,
        O: Optimizer<T, B> + 'static,
    {
        debug!("compiled with loss '{}' and optimizer '{}'", loss.name(), optimizer.name());
        self.loss = Some(Box::new(loss));
        self.optimizer = Some(Box::new(optimizer));
        self.history.clear();
        self
    }

    pub fn is_compiled(&self) -> bool {
        self.loss.is_some() && self.optimizer.is_some()
    }

    pub fn layers(&self) -> &[Box<dyn Layer<T, B>>] {
        &self.layers
    }

    /// Latest `(loss, gradient)` evaluations of [`backward`](Self::backward).
    pub fn loss_history(&self) -> &LossHistory<T, B> {
        &self.history
    }

    pub fn optimizer_mut(&mut self) -> Option<&mut Box<dyn Optimizer<T, B>>> {
        self.optimizer.as_mut()
    }

    /// Flag checked between samples; storing `true` stops a running `fit`.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }

    fn pool(&mut self) -> Result<Arc<ThreadPool>> {
        if let Some(pool) = &self.pool {
            return Ok(Arc::clone(pool));
        }
        let mut builder = ThreadPoolBuilder::new();
        if let Some(threads) = self.config.num_threads {
            builder = builder.num_threads(threads);
        }
        let pool = Arc::new(
            builder
                .build()
                .map_err(|e| NetError::invalid(format!("cannot build thread pool: {}", e)))?,
        );
        debug!("thread pool with {} threads", pool.current_num_threads());
        self.pool = Some(Arc::clone(&pool));
        Ok(pool)
    }

    pub fn forward(&mut self, input: &B) -> Result<&B> {
        forward_chain(&mut self.layers, input)?;
        last_output(&self.layers)
    }

    /// Output of the last forward pass.
    pub fn output(&self) -> Option<&B> {
        self.layers.last().and_then(|layer| layer.output())
    }

    /// Evaluates the loss at the last output and backpropagates its gradient
    /// through every layer in reverse order.
    pub fn backward(&mut self, label: &B) -> Result<LossValue<T, B>> {
        let loss = self.loss.as_ref().ok_or(NetError::NotCompiled)?;
        let last = self.layers.last_mut().ok_or_else(|| NetError::invalid("model has no layers"))?;
        let prediction = last.output().ok_or_else(|| NetError::not_forwarded(last.name()))?;
        let value = loss.evaluate(prediction, label)?;
        last.backward(&value.gradient)?;

        for i in (0..self.layers.len() - 1).rev() {
            let (head, tail) = self.layers.split_at_mut(i + 1);
            head[i].backward_from(tail[0].as_ref())?;
        }
        self.history.record(value.clone());
        Ok(value)
    }

    /// Applies the accumulated gradients of every layer, then advances the optimizer.
    pub fn update(&mut self) -> Result<()> {
        let optimizer = self.optimizer.as_mut().ok_or(NetError::NotCompiled)?;
        let mut guarded = GuardedOptimizer {
            inner: &mut **optimizer,
            clip_norm: self.config.clip_norm.map(T::from_f64_lossy),
            skip_non_finite: self.config.skip_non_finite,
        };
        for layer in self.layers.iter_mut() {
            layer.update(&mut guarded)?;
        }
        guarded.step();
        Ok(())
    }

    /// One forward, backward and update on a single sample; returns its loss.
    pub fn train_step(&mut self, input: &B, label: &B) -> Result<T> {
        forward_chain(&mut self.layers, input)?;
        let value = self.backward(label)?;
        self.update()?;
        Ok(value.loss)
    }

    /// Propagates `input_shape` through every layer and checks the result
    /// against `label_shape`. Returns the model's output shape.
    pub fn validate(&self, input_shape: &[usize], label_shape: &[usize]) -> Result<Vec<usize>> {
        if self.layers.is_empty() {
            return Err(NetError::invalid("model has no layers"));
        }
        let mut shape = input_shape.to_vec();
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 && !layer.propagates_input_gradient() {
                return Err(NetError::Unsupported {
                    layer: layer.name().to_string(),
                    operation: format!("backpropagating to a preceding layer (it sits at position {})", i),
                });
            }
            let next = layer.output_shape(&shape)?;
            debug!("#{} '{}': {:?} -> {:?}", i, layer.name(), shape, next);
            shape = next;
        }
        if shape != label_shape {
            return Err(NetError::shape("model output versus label", &shape, label_shape));
        }
        Ok(shape)
    }

    fn check_data(&self, inputs: &[B], labels: &[B]) -> Result<()> {
        if inputs.len() != labels.len() {
            return Err(NetError::invalid(format!(
                "{} inputs but {} labels",
                inputs.len(),
                labels.len()
            )));
        }
        if inputs.is_empty() {
            return Err(NetError::invalid("no training samples"));
        }
        let mut checked: Vec<(Vec<usize>, Vec<usize>)> = Vec::new();
        for (input, label) in inputs.iter().zip(labels) {
            let pair = (input.shape(), label.shape());
            if !checked.contains(&pair) {
                self.validate(&pair.0, &pair.1)?;
                checked.push(pair);
            }
        }
        Ok(())
    }

    /// Trains for `epochs` passes over the samples, in order.
    ///
    /// Counts and the whole shape chain are validated before any parameter is
    /// touched. Layers are in training mode during the call and in inference
    /// mode afterwards, whether it succeeds or not.
    pub fn fit(&mut self, inputs: &[B], labels: &[B], epochs: usize) -> Result<History<T>> {
        if !self.is_compiled() {
            return Err(NetError::NotCompiled);
        }
        self.check_data(inputs, labels)?;
        let pool = self.pool()?;

        info!(
            "training {} parameters on {} samples for {} epochs",
            self.parameter_count(),
            inputs.len(),
            epochs
        );
        self.set_training(true);
        let result = pool.install(|| self.run_epochs(inputs, labels, epochs));
        self.set_training(false);
        result
    }

    pub fn fit_with<L, O>(&mut self, inputs: &[B], labels: &[B], epochs: usize, loss: L, optimizer: O) -> Result<History<T>>
    where
        L: Loss<T, B> + 'static,
        O: Optimizer<T, B> + 'static,
    {
        self.compile(loss, optimizer);
        self.fit(inputs, labels, epochs)
    }

    fn run_epochs(&mut self, inputs: &[B], labels: &[B], epochs: usize) -> Result<History<T>> {
        let start = Instant::now();
        let mut history = History { losses: Vec::with_capacity(epochs), elapsed: Duration::ZERO };

        for epoch in 1..=epochs {
            let epoch_start = Instant::now();
            let mut bar = self
                .config
                .verbose
                .then(|| ProgressBar::new(inputs.len(), &format!("epoch {}/{}", epoch, epochs)));
            let mut total = T::zero();

            for (input, label) in inputs.iter().zip(labels) {
                if self.cancel.swap(false, Ordering::SeqCst) {
                    info!("training cancelled during epoch {}", epoch);
                    return Err(NetError::Cancelled);
                }
                let loss = self.train_step(input, label)?;
                total += loss;
                if let Some(bar) = bar.as_mut() {
                    bar.inc(format!("loss {:.6}", loss));
                }
            }

            let mean = total / T::from_usize_lossy(inputs.len());
            info!("epoch {}/{}: loss {:.6} ({:.2?})", epoch, epochs, mean, epoch_start.elapsed());
            history.losses.push(mean);
        }
        history.elapsed = start.elapsed();
        Ok(history)
    }

    /// Forward pass in inference mode; the previous mode is restored afterwards.
    pub fn predict(&mut self, input: &B) -> Result<B> {
        let pool = self.pool()?;
        let training = self.training;
        self.set_training(false);
        let result = pool.install(|| self.forward(input).map(|output| output.clone()));
        self.set_training(training);
        result
    }

    /// Mean loss over the samples, computed in inference mode.
    pub fn evaluate(&mut self, inputs: &[B], labels: &[B]) -> Result<T> {
        if self.loss.is_none() {
            return Err(NetError::NotCompiled);
        }
        self.check_data(inputs, labels)?;
        let pool = self.pool()?;
        let training = self.training;
        self.set_training(false);
        let result = pool.install(|| -> Result<T> {
            let mut total = T::zero();
            for (input, label) in inputs.iter().zip(labels) {
                forward_chain(&mut self.layers, input)?;
                let loss = self.loss.as_ref().ok_or(NetError::NotCompiled)?;
                total += loss.loss(last_output(&self.layers)?, label)?;
            }
            Ok(total / T::from_usize_lossy(inputs.len()))
        });
        self.set_training(training);
        result
    }

    /// Compares the analytic gradient of every trainable parameter with a
    /// central finite difference of the loss, scaled by each layer's
    /// [`gradient_scale`](Layer::gradient_scale).
    ///
    /// Returns `‖analytic - numeric‖ / (‖analytic‖ + ‖numeric‖)`, or zero
    /// when both are zero. Only meaningful for deterministic models: leave
    /// dropout out of a checked model. The training mode is left unchanged
    /// and non-trainable buffers such as moving statistics are restored.
    pub fn gradient_check(&mut self, input: &B, label: &B, epsilon: T) -> Result<T> {
        if self.loss.is_none() {
            return Err(NetError::NotCompiled);
        }
        self.validate(&input.shape(), &label.shape())?;
        let pool = self.pool()?;
        let buffers: Vec<B> = self
            .layers
            .iter()
            .flat_map(|layer| layer.parameters())
            .filter(|param| !param.trainable())
            .map(|param| param.value.clone())
            .collect();

        let result = pool.install(|| self.compare_gradients(input, label, epsilon));

        let targets = self
            .layers
            .iter_mut()
            .flat_map(|layer| layer.parameters_mut())
            .filter(|param| !param.trainable());
        for (param, value) in targets.zip(buffers) {
            param.assign(value)?;
        }
        result
    }

    fn compare_gradients(&mut self, input: &B, label: &B, epsilon: T) -> Result<T> {
        forward_chain(&mut self.layers, input)?;
        self.backward(label)?;

        let Self { layers, loss, .. } = self;
        let loss = loss.as_deref().ok_or(NetError::NotCompiled)?;
        let analytic: Vec<T> = layers
            .iter()
            .flat_map(|layer| layer.parameters())
            .filter(|param| param.trainable())
            .flat_map(|param| param.grad.iter().copied())
            .collect();

        let mut numeric = Vec::with_capacity(analytic.len());
        let two_epsilon = epsilon + epsilon;
        for l in 0..layers.len() {
            let scale = layers[l].gradient_scale();
            let shapes: Vec<(bool, usize)> =
                layers[l].parameters().iter().map(|p| (p.trainable(), p.value.size())).collect();
            for (index, (trainable, size)) in shapes.into_iter().enumerate() {
                if !trainable {
                    continue;
                }
                for k in 0..size {
                    let original = replace_element(layers[l].as_mut(), index, k, T::zero())
                        .ok_or_else(|| NetError::invalid("parameter changed size during gradient check"))?;

                    replace_element(layers[l].as_mut(), index, k, original + epsilon);
                    forward_chain(layers, input)?;
                    let plus = loss.loss(last_output(layers)?, label)?;

                    replace_element(layers[l].as_mut(), index, k, original - epsilon);
                    forward_chain(layers, input)?;
                    let minus = loss.loss(last_output(layers)?, label)?;

                    replace_element(layers[l].as_mut(), index, k, original);
                    numeric.push((plus - minus) / two_epsilon * scale);
                }
            }
        }

        let norm = |values: &mut dyn Iterator<Item = T>| values.map(|v| v * v).sum::<T>().sqrt();
        let difference = norm(&mut analytic.iter().zip(&numeric).map(|(&a, &n)| a - n));
        let denominator = norm(&mut analytic.iter().copied()) + norm(&mut numeric.iter().copied());
        debug!("gradient check over {} values: difference {}", analytic.len(), difference);
        if denominator == T::zero() {
            Ok(T::zero())
        } else {
            Ok(difference / denominator)
        }
    }

    /// Writes every parameter of every layer, trainable or not, one per line.
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        let mut count = 0;
        for layer in &self.layers {
            for param in layer.parameters() {
                io::write_tensor(&mut writer, &param.value)?;
                count += 1;
            }
        }
        writer.flush()?;
        info!("saved {} parameter tensors to {}", count, path.display());
        Ok(())
    }

    /// Restores weights written by [`save_weights`](Self::save_weights).
    ///
    /// The whole file is read and checked before any parameter is replaced.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()>
    where
        T: FromStr,
    {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);

        let mut staged = Vec::new();
        for layer in &self.layers {
            for param in layer.parameters() {
                let mut value = param.value.clone();
                io::read_tensor_into(&mut reader, &format!("{}/{}", layer.name(), param.name()), &mut value)?;
                staged.push(value);
            }
        }
        let mut rest = String::new();
        while reader.read_line(&mut rest)? > 0 {
            if !rest.trim().is_empty() {
                return Err(NetError::Parse(format!("{} holds more tensors than the model", path.display())));
            }
            rest.clear();
        }

        let params = self.layers.iter_mut().flat_map(|layer| layer.parameters_mut());
        for (param, value) in params.zip(staged) {
            param.assign(value)?;
        }
        info!("loaded weights from {}", path.display());
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.parameter_count()).sum()
    }

    /// One row per layer with its output shape for `input_shape` and its parameter count.
    pub fn summary(&self, input_shape: &[usize]) -> Result<String> {
        let mut text = format!("{:<28}{:<24}{:>10}\n", "Layer", "Output shape", "Params");
        let mut shape = input_shape.to_vec();
        for layer in &self.layers {
            shape = layer.output_shape(&shape)?;
            text.push_str(&format!(
                "{:<28}{:<24}{:>10}\n",
                layer.name(),
                format!("{:?}", shape),
                layer.parameter_count()
            ));
        }
        text.push_str(&format!("Total parameters: {}\n", self.parameter_count()));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use crate::nn::activations::Activation;
    use crate::nn::layers::{BatchNormalization, Dense, Dropout, Embedding, Flatten};
    use crate::nn::losses::{BinaryCrossEntropy, MeanSquaredError};
    use crate::nn::optimizers::Sgd;
    use ndarray::{array, Array, IxDyn};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    type Tensor64 = CpuTensor<f64>;

    fn random(shape: &[usize], rng: &mut StdRng) -> Tensor64 {
        CpuTensor::new(Array::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-1.0..1.0)))
    }

    fn xor() -> (Vec<Tensor64>, Vec<Tensor64>) {
        let rows = [([0.0, 0.0], 0.0), ([0.0, 1.0], 1.0), ([1.0, 0.0], 1.0), ([1.0, 1.0], 0.0)];
        let inputs = rows.iter().map(|(x, _)| CpuTensor::new(array![[x[0], x[1]]].into_dyn())).collect();
        let labels = rows.iter().map(|(_, y)| CpuTensor::new(array![[*y]].into_dyn())).collect();
        (inputs, labels)
    }

    fn weights(model: &Sequential<f64, Tensor64>) -> Vec<Tensor64> {
        model.layers().iter().flat_map(|l| l.parameters()).map(|p| p.value.clone()).collect()
    }

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sequent-{}-{}.txt", tag, std::process::id()))
    }

    #[test]
    fn test_xor_converges() {
        let (inputs, labels) = xor();
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = Sequential::<f64, Tensor64>::new();
        model
            .add(Dense::with_rng(2, 4, Activation::Sigmoid, &mut rng))
            .add(Dense::with_rng(4, 1, Activation::Sigmoid, &mut rng));
        model.compile(BinaryCrossEntropy::default(), Sgd::new(0.01, 0.0));

        let history = model.fit(&inputs, &labels, 20000).unwrap();
        assert_eq!(history.losses.len(), 20000);

        for (x, y) in inputs.iter().zip(&labels) {
            let predicted = model.predict(x).unwrap().get_data()[[0, 0]];
            let expected = y.get_data()[[0, 0]];
            assert!((predicted - expected).abs() < 0.2, "{:?}: predicted {}, expected {}", x.get_data(), predicted, expected);
        }
    }

    #[test]
    fn test_dense_gradient_check() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = random(&[4, 3], &mut rng);
        let b = random(&[3], &mut rng);
        let mut model = Sequential::<f64, Tensor64>::new();
        model.add(Dense::from_weights(w, Some(b), Activation::Sigmoid).unwrap());
        model.compile(MeanSquaredError, Sgd::default());

        let x = random(&[2, 4], &mut rng);
        let y = random(&[2, 3], &mut rng);
        let error = model.gradient_check(&x, &y, 1e-7).unwrap();
        assert!(error < 1e-5, "relative error {}", error);
    }

    #[test]
    fn test_gradient_check_restores_moving_statistics() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut model = Sequential::<f64, Tensor64>::new();
        model
            .add(Dense::with_rng(3, 4, Activation::Linear, &mut rng))
            .add(BatchNormalization::new(4));
        model.compile(MeanSquaredError, Sgd::default());
        let before = weights(&model);

        let x = random(&[6, 3], &mut rng).add_scalar(3.0);
        let y = random(&[6, 4], &mut rng);
        let error = model.gradient_check(&x, &y, 1e-6).unwrap();
        assert!(error < 1e-6, "relative error {}", error);

        let after = weights(&model);
        assert_eq!(before.len(), after.len());
        assert!(before.iter().zip(&after).all(|(a, b)| a.get_data() == b.get_data()));
    }

    #[test]
    fn test_embedding_gradient_check() {
        let mut rng = StdRng::seed_from_u64(8);
        for batch in [1, 3] {
            let mut model = Sequential::<f64, Tensor64>::new();
            model.add(Embedding::with_rng(5, 2, &mut rng)).add(Flatten::new());
            model.compile(MeanSquaredError, Sgd::default());

            let codes = CpuTensor::new(Array::from_shape_fn((batch, 4), |(n, t)| ((n * 3 + t * 2) % 5) as f64).into_dyn());
            let y = random(&[batch, 8], &mut rng);
            let error = model.gradient_check(&codes, &y, 1e-6).unwrap();
            assert!(error < 1e-6, "batch {}: relative error {}", batch, error);
        }
    }

    #[test]
    fn test_backward_records_loss_history() {
        let config = TrainConfig { history_len: 3, ..TrainConfig::default() };
        let mut model = Sequential::<f64, Tensor64>::with_config(config);
        model.add(Dense::new(2, 1, Activation::Sigmoid));
        model.compile(BinaryCrossEntropy::default(), Sgd::default());
        let (inputs, labels) = xor();

        let history = model.fit(&inputs, &labels, 2).unwrap();
        let recorded = model.loss_history();
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded.last().unwrap().gradient.shape(), vec![1, 1]);
        // the three most recent sample losses are part of the last epoch's mean over four
        let recent: f64 = recorded.losses().iter().sum();
        assert!(recent <= history.final_loss().unwrap() * 4.0 + 1e-12);

        model.compile(BinaryCrossEntropy::default(), Sgd::default());
        assert!(model.loss_history().is_empty());
    }

    #[test]
    fn test_incompatible_chain_fails_before_training() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model
            .add(Dense::new(3, 4, Activation::Relu))
            .add(Dense::new(5, 1, Activation::Linear));
        model.compile(MeanSquaredError, Sgd::default());
        let before = weights(&model);

        let inputs = vec![CpuTensor::ones(&[2, 3])];
        let labels = vec![CpuTensor::ones(&[2, 1])];
        assert!(matches!(model.fit(&inputs, &labels, 3), Err(NetError::ShapeMismatch { .. })));
        let after = weights(&model);
        assert!(before.iter().zip(&after).all(|(a, b)| a.get_data() == b.get_data()));
    }

    #[test]
    fn test_label_shape_is_validated() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model.add(Dense::new(3, 2, Activation::Linear));
        model.compile(MeanSquaredError, Sgd::default());
        let result = model.fit(&[CpuTensor::ones(&[1, 3])], &[CpuTensor::ones(&[1, 3])], 1);
        assert!(matches!(result, Err(NetError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_sample_counts() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model.add(Dense::new(2, 1, Activation::Linear));
        model.compile(MeanSquaredError, Sgd::default());
        let (inputs, labels) = xor();
        assert!(matches!(model.fit(&inputs, &labels[..3], 1), Err(NetError::InvalidArgument(_))));
        assert!(matches!(model.fit(&[], &[], 1), Err(NetError::InvalidArgument(_))));
        assert!(matches!(model.evaluate(&inputs[..1], &labels), Err(NetError::InvalidArgument(_))));
    }

    #[test]
    fn test_training_requires_compile() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model.add(Dense::new(2, 1, Activation::Linear));
        let (inputs, labels) = xor();
        assert!(matches!(model.fit(&inputs, &labels, 1), Err(NetError::NotCompiled)));
        model.forward(&inputs[0]).unwrap();
        assert!(matches!(model.backward(&labels[0]), Err(NetError::NotCompiled)));
        assert!(matches!(model.update(), Err(NetError::NotCompiled)));
    }

    #[test]
    fn test_embedding_must_come_first() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model
            .add(Dense::new(3, 3, Activation::Relu))
            .add(Embedding::new(10, 4))
            .add(Flatten::new());
        assert!(matches!(model.validate(&[2, 3], &[2, 12]), Err(NetError::Unsupported { .. })));

        let mut model = Sequential::<f64, Tensor64>::new();
        model.add(Embedding::new(10, 4)).add(Flatten::new());
        assert_eq!(model.validate(&[2, 3], &[2, 12]).unwrap(), vec![2, 12]);
    }

    #[test]
    fn test_cancellation() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model.add(Dense::new(2, 1, Activation::Sigmoid));
        model.compile(BinaryCrossEntropy::default(), Sgd::default());
        let (inputs, labels) = xor();

        let token = model.cancellation_token();
        token.store(true, Ordering::SeqCst);
        assert!(matches!(model.fit(&inputs, &labels, 10), Err(NetError::Cancelled)));
        assert!(!model.is_training());

        let history = model.fit(&inputs, &labels, 2).unwrap();
        assert_eq!(history.losses.len(), 2);
    }

    #[test]
    fn test_non_finite_gradients_are_skipped() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model.add(Dense::new(2, 2, Activation::Linear));
        model.compile(MeanSquaredError, Sgd::new(0.1, 0.0));
        let before = weights(&model);

        let label = CpuTensor::new(array![[f64::NAN, 0.0]].into_dyn());
        model.train_step(&CpuTensor::ones(&[1, 2]), &label).unwrap();
        let after = weights(&model);
        assert!(before.iter().zip(&after).all(|(a, b)| a.get_data() == b.get_data()));
    }

    #[test]
    fn test_gradient_clipping() {
        let config = TrainConfig { clip_norm: Some(1e-3), ..TrainConfig::default() };
        let w = CpuTensor::new(array![[0.0], [0.0]].into_dyn());
        let mut model = Sequential::<f64, Tensor64>::with_config(config);
        model.add(Dense::from_weights(w, None, Activation::Linear).unwrap());
        model.compile(MeanSquaredError, Sgd::new(1.0, 0.0));

        let x = CpuTensor::new(array![[100.0, 0.0]].into_dyn());
        let y = CpuTensor::new(array![[100.0]].into_dyn());
        model.train_step(&x, &y).unwrap();
        let step = weights(&model)[0].norm();
        assert!((step - 1e-3).abs() < 1e-12, "step {}", step);
    }

    #[test]
    fn test_predict_uses_inference_mode() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model
            .add(Dense::from_weights(CpuTensor::ones(&[4, 4]), None, Activation::Linear).unwrap())
            .add(Dropout::with_seed(0.5, 3).unwrap());
        let x = CpuTensor::ones(&[1, 4]);
        let predicted = model.predict(&x).unwrap();
        assert!(predicted.iter().all(|&v| v == 4.0));
        assert!(model.is_training());
    }

    #[test]
    fn test_evaluate_matches_loss() {
        let mut model = Sequential::<f64, Tensor64>::new();
        model.add(Dense::from_weights(CpuTensor::ones(&[2, 1]), None, Activation::Linear).unwrap());
        model.compile(MeanSquaredError, Sgd::default());
        let (inputs, labels) = xor();
        // outputs 0, 1, 1, 2 against labels 0, 1, 1, 0
        assert!((model.evaluate(&inputs, &labels).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_save_and_load_weights() {
        let path = temp_path("weights");
        let mut rng = StdRng::seed_from_u64(4);
        let mut source = Sequential::<f64, Tensor64>::new();
        source
            .add(Dense::with_rng(3, 5, Activation::Tanh, &mut rng))
            .add(Dense::with_rng(5, 2, Activation::Linear, &mut rng));
        source.save_weights(&path).unwrap();

        let mut target = Sequential::<f64, Tensor64>::new();
        target.add(Dense::new(3, 5, Activation::Tanh)).add(Dense::new(5, 2, Activation::Linear));
        target.load_weights(&path).unwrap();
        let x = random(&[4, 3], &mut rng);
        assert_eq!(source.predict(&x).unwrap().get_data(), target.predict(&x).unwrap().get_data());

        let mut wrong = Sequential::<f64, Tensor64>::new();
        wrong.add(Dense::new(3, 4, Activation::Tanh)).add(Dense::new(4, 2, Activation::Linear));
        let before = weights(&wrong);
        assert!(matches!(wrong.load_weights(&path), Err(NetError::WeightCount { .. })));
        assert!(before.iter().zip(&weights(&wrong)).all(|(a, b)| a.get_data() == b.get_data()));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_summary() {
        let mut model = Sequential::<f32, CpuTensor<f32>>::new();
        model
            .add(Dense::new(8, 16, Activation::Relu).named("hidden"))
            .add(Dense::new(16, 1, Activation::Sigmoid).named("out"));
        let summary = model.summary(&[32, 8]).unwrap();
        assert!(summary.contains("hidden"));
        assert!(summary.contains("[32, 1]"));
        assert!(summary.contains(&format!("Total parameters: {}", 8 * 16 + 16 + 16 + 1)));
        assert_eq!(model.parameter_count(), 161);
    }
}
