use super::{check_dim, check_gradient, check_rank, Layer, Param};
use crate::backends::cpu::PARALLEL_THRESHOLD;
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};
use crate::nn::activations::Activation;
use crate::nn::initializers::Initializer;

use ndarray::{Array2, Array4, ArrayView2, ArrayView4, ArrayViewMut1, ArrayViewMut3, Ix4, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Padding {
    /// No padding; the output shrinks by the effective kernel extent.
    #[default]
    Valid,
    /// Zero padding so that `out = ceil(in / stride)`.
    Same,
}

/// Sliding-window geometry shared by convolution and pooling layers.
///
/// "Input" is always the larger (image) side and "output" the grid of
/// window positions; padding is virtual, out-of-range reads are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub batch: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub channels: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub pad: (usize, usize),
}

fn output_extent(padding: Padding, input: usize, kernel: usize, stride: usize, dilation: usize) -> Result<(usize, usize)> {
    let effective = (kernel - 1) * dilation + 1;
    match padding {
        Padding::Valid => {
            if input < effective {
                return Err(NetError::invalid(format!(
                    "input extent {} is smaller than the effective kernel extent {}",
                    input, effective
                )));
            }
            Ok(((input - effective) / stride + 1, 0))
        }
        Padding::Same => {
            let out = (input + stride - 1) / stride;
            let total = ((out.max(1) - 1) * stride + effective).saturating_sub(input);
            Ok((out, total / 2))
        }
    }
}

impl ConvGeometry {
    pub fn new(
        input: (usize, usize, usize, usize),
        kernel: (usize, usize),
        stride: (usize, usize),
        dilation: (usize, usize),
        padding: Padding,
    ) -> Result<Self> {
        let (batch, in_h, in_w, channels) = input;
        let (out_h, pad_h) = output_extent(padding, in_h, kernel.0, stride.0, dilation.0)?;
        let (out_w, pad_w) = output_extent(padding, in_w, kernel.1, stride.1, dilation.1)?;
        Ok(Self { batch, in_h, in_w, channels, out_h, out_w, kernel, stride, dilation, pad: (pad_h, pad_w) })
    }

    pub fn rows(&self) -> usize {
        self.batch * self.out_h * self.out_w
    }

    pub fn patch(&self) -> usize {
        self.kernel.0 * self.kernel.1 * self.channels
    }

    /// Input row read by kernel row `ki` of output row `oi`, if not padding.
    pub fn source_row(&self, oi: usize, ki: usize) -> Option<usize> {
        (oi * self.stride.0 + ki * self.dilation.0)
            .checked_sub(self.pad.0)
            .filter(|&r| r < self.in_h)
    }

    pub fn source_col(&self, oj: usize, kj: usize) -> Option<usize> {
        (oj * self.stride.1 + kj * self.dilation.1)
            .checked_sub(self.pad.1)
            .filter(|&c| c < self.in_w)
    }

    fn split_row(&self, row: usize) -> (usize, usize, usize) {
        let per_image = self.out_h * self.out_w;
        (row / per_image, (row % per_image) / self.out_w, row % self.out_w)
    }
}

/// Rearranges every receptive field into one row of a
/// `(batch·out_h·out_w, kh·kw·channels)` matrix.
pub(crate) fn im2col<T: Scalar>(input: ArrayView4<T>, g: &ConvGeometry) -> Array2<T> {
    let mut cols = Array2::<T>::zeros((g.rows(), g.patch()));
    let parallel = cols.len() >= PARALLEL_THRESHOLD;
    let fill = |row: usize, mut dest: ArrayViewMut1<T>| {
        let (n, oi, oj) = g.split_row(row);
        for ki in 0..g.kernel.0 {
            let Some(r) = g.source_row(oi, ki) else { continue };
            for kj in 0..g.kernel.1 {
                let Some(c) = g.source_col(oj, kj) else { continue };
                let offset = (ki * g.kernel.1 + kj) * g.channels;
                for ch in 0..g.channels {
                    dest[offset + ch] = input[[n, r, c, ch]];
                }
            }
        }
    };
    let zip = Zip::indexed(cols.rows_mut());
    if parallel {
        zip.par_for_each(fill);
    } else {
        zip.for_each(fill);
    }
    cols
}

/// Adjoint of [`im2col`]: scatter-adds every patch row back onto the image.
pub(crate) fn col2im<T: Scalar>(cols: ArrayView2<T>, g: &ConvGeometry) -> Array4<T> {
    debug_assert_eq!(cols.dim(), (g.rows(), g.patch()));
    let mut image = Array4::<T>::zeros((g.batch, g.in_h, g.in_w, g.channels));
    let parallel = image.len() >= PARALLEL_THRESHOLD;
    let scatter = |n: usize, mut dest: ArrayViewMut3<T>| {
        for oi in 0..g.out_h {
            for oj in 0..g.out_w {
                let row = cols.row((n * g.out_h + oi) * g.out_w + oj);
                for ki in 0..g.kernel.0 {
                    let Some(r) = g.source_row(oi, ki) else { continue };
                    for kj in 0..g.kernel.1 {
                        let Some(c) = g.source_col(oj, kj) else { continue };
                        let offset = (ki * g.kernel.1 + kj) * g.channels;
                        for ch in 0..g.channels {
                            dest[[r, c, ch]] += row[offset + ch];
                        }
                    }
                }
            }
        }
    };
    let zip = Zip::indexed(image.outer_iter_mut());
    if parallel {
        zip.par_for_each(scatter);
    } else {
        zip.for_each(scatter);
    }
    image
}

pub(crate) fn view4<'a, T: Scalar, B: Tensor<T>>(tensor: &'a B, context: &str) -> Result<ArrayView4<'a, T>> {
    tensor
        .get_data()
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| NetError::invalid(format!("{} expects a rank-4 tensor, got {:?}", context, tensor.shape())))
}

pub(crate) fn view2<'a, T: Scalar, B: Tensor<T>>(tensor: &'a B, context: &str) -> Result<ArrayView2<'a, T>> {
    tensor
        .get_data()
        .view()
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|_| NetError::invalid(format!("{} expects a rank-2 tensor, got {:?}", context, tensor.shape())))
}

pub(crate) fn check_window(name: &str, kernel: (usize, usize), stride: (usize, usize), dilation: (usize, usize)) -> Result<()> {
    if kernel.0 == 0 || kernel.1 == 0 || stride.0 == 0 || stride.1 == 0 || dilation.0 == 0 || dilation.1 == 0 {
        return Err(NetError::invalid(format!(
            "layer '{}' needs positive kernel {:?}, stride {:?} and dilation {:?}",
            name, kernel, stride, dilation
        )));
    }
    Ok(())
}

/// Hyper-parameters shared by [`Conv2D`] and its transposed counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvOptions {
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub padding: Padding,
    pub activation: Activation,
    pub kernel_initializer: Initializer,
    pub use_bias: bool,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            dilation: (1, 1),
            padding: Padding::Valid,
            activation: Activation::Linear,
            kernel_initializer: Initializer::GlorotUniform,
            use_bias: true,
        }
    }
}

struct ConvCache<B> {
    geometry: ConvGeometry,
    cols: B,
    z: B,
}

/// 2-D convolution over `(batch, height, width, channels)` inputs with a
/// `(kh, kw, in_channels, filters)` kernel.
pub struct Conv2D<T, B> {
    name: String,
    in_channels: usize,
    filters: usize,
    kernel_size: (usize, usize),
    options: ConvOptions,
    kernel: Param<T, B>,
    bias: Option<Param<T, B>>,
    cache: Option<ConvCache<B>>,
    output: Option<B>,
    input_grad: Option<B>,
}

impl<T: Scalar, B: Tensor<T>> Conv2D<T, B> {
    pub fn new(in_channels: usize, filters: usize, kernel_size: (usize, usize), options: ConvOptions) -> Result<Self> {
        Self::with_rng(in_channels, filters, kernel_size, options, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        in_channels: usize,
        filters: usize,
        kernel_size: (usize, usize),
        options: ConvOptions,
        rng: &mut R,
    ) -> Result<Self> {
        let receptive = kernel_size.0 * kernel_size.1;
        let kernel = options.kernel_initializer.sample(
            &[kernel_size.0, kernel_size.1, in_channels, filters],
            receptive * in_channels,
            receptive * filters,
            rng,
        )?;
        let bias = options.use_bias.then(|| B::zeros(&[filters]));
        Self::from_weights(kernel, bias, options)
    }

    /// Builds the layer from a `(kh, kw, in_channels, filters)` kernel and an optional `(filters)` bias.
    pub fn from_weights(kernel: B, bias: Option<B>, options: ConvOptions) -> Result<Self> {
        let shape = kernel.shape();
        if shape.len() != 4 {
            return Err(NetError::invalid(format!("conv2d kernel must be rank 4, got {:?}", shape)));
        }
        check_window("conv2d", (shape[0], shape[1]), options.stride, options.dilation)?;
        if let Some(bias) = &bias {
            if bias.shape() != [shape[3]] {
                return Err(NetError::shape("conv2d bias", &[shape[3]], &bias.shape()));
            }
        }
        Ok(Self {
            name: "conv2d".to_string(),
            in_channels: shape[2],
            filters: shape[3],
            kernel_size: (shape[0], shape[1]),
            options,
            kernel: Param::new("kernel", kernel),
            bias: bias.map(|b| Param::new("bias", b)),
            cache: None,
            output: None,
            input_grad: None,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kernel(&self) -> &B {
        &self.kernel.value
    }

    pub fn kernel_grad(&self) -> &B {
        &self.kernel.grad
    }

    fn geometry(&self, shape: &[usize]) -> Result<ConvGeometry> {
        check_rank(&self.name, shape, &[4])?;
        check_dim(&self.name, shape, 3, self.in_channels)?;
        ConvGeometry::new(
            (shape[0], shape[1], shape[2], shape[3]),
            self.kernel_size,
            self.options.stride,
            self.options.dilation,
            self.options.padding,
        )
    }

    fn kernel_matrix(&self) -> Result<B> {
        self.kernel.value.reshape(&[self.kernel_size.0 * self.kernel_size.1 * self.in_channels, self.filters])
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for Conv2D<T, B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        let geometry = self.geometry(&input.shape())?;
        let cols = B::new(im2col(view4(input, &self.name)?, &geometry).into_dyn());
        debug_assert_eq!(cols.shape(), vec![geometry.rows(), geometry.patch()]);

        let mut z = cols.matmul(&self.kernel_matrix()?)?;
        if let Some(bias) = &self.bias {
            z = z.add(&bias.value)?;
        }
        let z = z.reshape(&[geometry.batch, geometry.out_h, geometry.out_w, self.filters])?;
        self.output = Some(self.options.activation.activate(&z));
        self.cache = Some(ConvCache { geometry, cols, z });
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let (cache, output) = match (&self.cache, &self.output) {
            (Some(cache), Some(output)) => (cache, output),
            _ => return Err(NetError::not_forwarded(&self.name)),
        };
        check_gradient(&self.name, &output.shape(), &gradient.shape())?;

        let g = cache.geometry;
        let dz = self.options.activation.backward(&cache.z, output, gradient)?;
        let dz = dz.reshape(&[g.rows(), self.filters])?;

        let dk = cache.cols.transpose().matmul(&dz)?;
        self.kernel.grad = dk.reshape(&self.kernel.value.shape())?;
        if let Some(bias) = &mut self.bias {
            bias.grad = dz.sum_axis(0);
        }

        let dcols = dz.matmul(&self.kernel_matrix()?.transpose())?;
        let dx = col2im(view2(&dcols, &self.name)?, &g);
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
        let g = self.geometry(input_shape)?;
        Ok(vec![g.batch, g.out_h, g.out_w, self.filters])
    }

    fn parameters(&self) -> Vec<&Param<T, B>> {
        let mut params = vec![&self.kernel];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param<T, B>> {
        let mut params = vec![&mut self.kernel];
        params.extend(self.bias.as_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use crate::nn::losses::MeanSquaredError;
    use crate::nn::sequential::Sequential;
    use ndarray::Array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn image(h: usize, w: usize) -> CpuTensor<f64> {
        let data = Array::from_shape_fn((1, h, w, 1), |(_, i, j, _)| (i * w + j) as f64);
        CpuTensor::new(data.into_dyn())
    }

    #[test]
    fn test_same_padding_geometry() {
        let g = ConvGeometry::new((1, 5, 5, 1), (3, 3), (2, 2), (1, 1), Padding::Same).unwrap();
        assert_eq!((g.out_h, g.out_w), (3, 3));
        assert_eq!(g.pad, (1, 1));

        let g = ConvGeometry::new((1, 6, 6, 1), (3, 3), (2, 2), (1, 1), Padding::Same).unwrap();
        assert_eq!((g.out_h, g.pad.0), (3, 0));

        let g = ConvGeometry::new((1, 7, 7, 1), (3, 3), (1, 1), (2, 2), Padding::Valid).unwrap();
        assert_eq!((g.out_h, g.out_w), (3, 3));
        assert!(ConvGeometry::new((1, 2, 2, 1), (3, 3), (1, 1), (1, 1), Padding::Valid).is_err());
    }

    #[test]
    fn test_im2col_col2im_are_adjoint() {
        let g = ConvGeometry::new((2, 5, 4, 3), (3, 2), (2, 1), (1, 2), Padding::Same).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let x = Array::from_shape_fn((2, 5, 4, 3), |_| rng.gen_range(-1.0..1.0));
        let y = Array::from_shape_fn((g.rows(), g.patch()), |_| rng.gen_range(-1.0..1.0));

        let lhs: f64 = (&im2col(x.view(), &g) * &y).sum();
        let rhs: f64 = (&x * &col2im(y.view(), &g)).sum();
        assert!((lhs - rhs).abs() < 1e-10);
    }

    #[test]
    fn test_valid_convolution_values() {
        let kernel = CpuTensor::new(Array::from_shape_vec((2, 2, 1, 1), vec![1.0, 0.0, 0.0, -1.0]).unwrap().into_dyn());
        let mut conv = Conv2D::<f64, CpuTensor<f64>>::from_weights(kernel, None, ConvOptions::default()).unwrap();
        conv.forward(&image(3, 3)).unwrap();
        let out = conv.output().unwrap();
        assert_eq!(out.shape(), vec![1, 2, 2, 1]);
        // x[i][j] - x[i+1][j+1] is constant -4 on this ramp
        assert!(out.iter().all(|&v| (v + 4.0).abs() < 1e-12));
    }

    #[test]
    fn test_strided_same_output_shape() {
        let options = ConvOptions { stride: (2, 2), padding: Padding::Same, ..ConvOptions::default() };
        let conv = Conv2D::<f32, CpuTensor<f32>>::new(3, 8, (3, 3), options).unwrap();
        assert_eq!(conv.output_shape(&[4, 9, 10, 3]).unwrap(), vec![4, 5, 5, 8]);
        assert!(conv.output_shape(&[4, 9, 10, 2]).is_err());
    }

    #[test]
    fn test_conv2d_gradient_check() {
        let mut rng = StdRng::seed_from_u64(21);
        let options = ConvOptions {
            stride: (2, 1),
            dilation: (1, 2),
            padding: Padding::Same,
            activation: Activation::Tanh,
            ..ConvOptions::default()
        };
        let conv = Conv2D::with_rng(2, 3, (2, 3), options, &mut rng).unwrap();
        let mut model = Sequential::<f64, CpuTensor<f64>>::new();
        model.add(conv);

        let x = CpuTensor::new(Array::from_shape_fn((2, 5, 4, 2), |_| rng.gen_range(-1.0..1.0)).into_dyn());
        let y = CpuTensor::new(Array::from_shape_fn((2, 3, 4, 3), |_| rng.gen_range(-1.0..1.0)).into_dyn());
        model.compile(MeanSquaredError, crate::nn::optimizers::Sgd::default());
        let error = model.gradient_check(&x, &y, 1e-6).unwrap();
        assert!(error < 1e-6, "relative error {}", error);
    }
}
