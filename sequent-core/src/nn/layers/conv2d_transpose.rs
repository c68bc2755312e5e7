use super::conv2d::{check_window, col2im, im2col, view2, view4, ConvGeometry, ConvOptions, Padding};
use super::{check_dim, check_gradient, check_rank, Layer, Param};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

use rand::Rng;

fn transposed_extent(
    padding: Padding,
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    output_padding: Option<usize>,
) -> usize {
    let effective = (kernel - 1) * dilation + 1;
    match (padding, output_padding) {
        (Padding::Same, None) => input * stride,
        (Padding::Same, Some(extra)) => (input - 1) * stride + 1 + extra,
        (Padding::Valid, None) => (input - 1) * stride + effective.max(stride),
        (Padding::Valid, Some(extra)) => (input - 1) * stride + effective + extra,
    }
}

struct TransposeCache<B> {
    geometry: ConvGeometry,
    input_rows: B,
    z: B,
}

/// Transposed 2-D convolution, the adjoint of [`Conv2D`](super::Conv2D).
///
/// Kernel layout is `(kh, kw, filters, in_channels)`. Under `Same` padding
/// with a stride above one several output sizes map back to the same input
/// size; `output_padding` picks `(in - 1) * stride + 1 + output_padding`
/// instead of the default `in * stride`.
pub struct Conv2DTranspose<T, B> {
    name: String,
    in_channels: usize,
    filters: usize,
    kernel_size: (usize, usize),
    options: ConvOptions,
    output_padding: Option<(usize, usize)>,
    kernel: Param<T, B>,
    bias: Option<Param<T, B>>,
    cache: Option<TransposeCache<B>>,
    output: Option<B>,
    input_grad: Option<B>,
}

impl<T: Scalar, B: Tensor<T>> Conv2DTranspose<T, B> {
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
            &[kernel_size.0, kernel_size.1, filters, in_channels],
            receptive * in_channels,
            receptive * filters,
            rng,
        )?;
        let bias = options.use_bias.then(|| B::zeros(&[filters]));
        Self::from_weights(kernel, bias, options)
    }

    pub fn from_weights(kernel: B, bias: Option<B>, options: ConvOptions) -> Result<Self> {
        let shape = kernel.shape();
        if shape.len() != 4 {
            return Err(NetError::invalid(format!("conv2d_transpose kernel must be rank 4, got {:?}", shape)));
        }
        check_window("conv2d_transpose", (shape[0], shape[1]), options.stride, options.dilation)?;
        if let Some(bias) = &bias {
            if bias.shape() != [shape[2]] {
                return Err(NetError::shape("conv2d_transpose bias", &[shape[2]], &bias.shape()));
            }
        }
        Ok(Self {
            name: "conv2d_transpose".to_string(),
            in_channels: shape[3],
            filters: shape[2],
            kernel_size: (shape[0], shape[1]),
            options,
            output_padding: None,
            kernel: Param::new("kernel", kernel),
            bias: bias.map(|b| Param::new("bias", b)),
            cache: None,
            output: None,
            input_grad: None,
        })
    }

    /// Each component must be smaller than the stride along its axis.
    pub fn with_output_padding(mut self, output_padding: (usize, usize)) -> Result<Self> {
        let stride = self.options.stride;
        if output_padding.0 >= stride.0 || output_padding.1 >= stride.1 {
            return Err(NetError::invalid(format!(
                "output padding {:?} must be smaller than the stride {:?}",
                output_padding, stride
            )));
        }
        self.output_padding = Some(output_padding);
        Ok(self)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kernel(&self) -> &B {
        &self.kernel.value
    }

    /// Geometry of the forward convolution this layer is the adjoint of.
    fn geometry(&self, shape: &[usize]) -> Result<ConvGeometry> {
        check_rank(&self.name, shape, &[4])?;
        check_dim(&self.name, shape, 3, self.in_channels)?;
        if shape[1] == 0 || shape[2] == 0 {
            return Err(NetError::invalid(format!("layer '{}' got an empty image {:?}", self.name, shape)));
        }
        let o = self.options;
        let out_h = transposed_extent(o.padding, shape[1], self.kernel_size.0, o.stride.0, o.dilation.0, self.output_padding.map(|p| p.0));
        let out_w = transposed_extent(o.padding, shape[2], self.kernel_size.1, o.stride.1, o.dilation.1, self.output_padding.map(|p| p.1));

        let geometry = ConvGeometry::new(
            (shape[0], out_h, out_w, self.filters),
            self.kernel_size,
            o.stride,
            o.dilation,
            o.padding,
        )?;
        debug_assert_eq!((geometry.out_h, geometry.out_w), (shape[1], shape[2]));
        Ok(geometry)
    }

    fn kernel_matrix(&self) -> Result<B> {
        self.kernel.value.reshape(&[self.kernel_size.0 * self.kernel_size.1 * self.filters, self.in_channels])
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for Conv2DTranspose<T, B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        let g = self.geometry(&input.shape())?;
        let input_rows = input.reshape(&[g.rows(), self.in_channels])?;
        let cols = input_rows.matmul(&self.kernel_matrix()?.transpose())?;

        let mut z = B::new(col2im(view2(&cols, &self.name)?, &g).into_dyn());
        if let Some(bias) = &self.bias {
            z = z.add(&bias.value)?;
        }
        self.output = Some(self.options.activation.activate(&z));
        self.cache = Some(TransposeCache { geometry: g, input_rows, z });
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
        if let Some(bias) = &mut self.bias {
            bias.grad = dz.reshape(&[g.batch * g.in_h * g.in_w, self.filters])?.sum_axis(0);
        }

        let dcols = B::new(im2col(view4(&dz, &self.name)?, &g).into_dyn());
        let dk = dcols.transpose().matmul(&cache.input_rows)?;
        self.kernel.grad = dk.reshape(&self.kernel.value.shape())?;

        let dx = dcols.matmul(&self.kernel_matrix()?)?;
        self.input_grad = Some(dx.reshape(&[g.batch, g.out_h, g.out_w, self.in_channels])?);
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
        Ok(vec![g.batch, g.in_h, g.in_w, self.filters])
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
