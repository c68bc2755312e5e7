use super::conv2d::{check_window, view4, ConvGeometry, Padding};
use super::{check_gradient, check_rank, Layer};
use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

use ndarray::{Array4, Ix4};

fn pool_geometry(name: &str, shape: &[usize], pool: (usize, usize), stride: (usize, usize), padding: Padding) -> Result<ConvGeometry> {
    check_rank(name, shape, &[4])?;
    ConvGeometry::new((shape[0], shape[1], shape[2], shape[3]), pool, stride, (1, 1), padding)
}

/// Max pooling over `(batch, height, width, channels)`.
///
/// The forward pass records the flat input position of every window's
/// maximum; the backward pass routes each output gradient to that position
/// only. Padded positions never win.
pub struct MaxPooling2D<T, B> {
    name: String,
    pool: (usize, usize),
    stride: (usize, usize),
    padding: Padding,
    argmax: Vec<usize>,
    input_shape: Option<Vec<usize>>,
    output: Option<B>,
    input_grad: Option<B>,
    dtype: std::marker::PhantomData<T>,
}

impl<T: Scalar, B: Tensor<T>> MaxPooling2D<T, B> {
    /// Strides default to the pool size.
    pub fn new(pool: (usize, usize)) -> Result<Self> {
        Self::with_stride(pool, pool, Padding::Valid)
    }

    pub fn with_stride(pool: (usize, usize), stride: (usize, usize), padding: Padding) -> Result<Self> {
        check_window("max_pooling2d", pool, stride, (1, 1))?;
        Ok(Self {
            name: "max_pooling2d".to_string(),
            pool,
            stride,
            padding,
            argmax: Vec::new(),
            input_shape: None,
            output: None,
            input_grad: None,
            dtype: std::marker::PhantomData,
        })
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for MaxPooling2D<T, B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        let g = pool_geometry(&self.name, &input.shape(), self.pool, self.stride, self.padding)?;
        let x = view4(input, &self.name)?;
        let mut out = Array4::<T>::zeros((g.batch, g.out_h, g.out_w, g.channels));
        let mut argmax = Vec::with_capacity(out.len());

        for n in 0..g.batch {
            for oi in 0..g.out_h {
                for oj in 0..g.out_w {
                    for ch in 0..g.channels {
                        let mut best: Option<(T, usize)> = None;
                        for ki in 0..g.kernel.0 {
                            let Some(r) = g.source_row(oi, ki) else { continue };
                            for kj in 0..g.kernel.1 {
                                let Some(c) = g.source_col(oj, kj) else { continue };
                                let value = x[[n, r, c, ch]];
                                if best.map_or(true, |(b, _)| value > b) {
                                    let flat = ((n * g.in_h + r) * g.in_w + c) * g.channels + ch;
                                    best = Some((value, flat));
                                }
                            }
                        }
                        let (value, flat) = best.ok_or_else(|| {
                            NetError::invalid(format!("pooling window ({}, {}) covers no input", oi, oj))
                        })?;
                        out[[n, oi, oj, ch]] = value;
                        argmax.push(flat);
                    }
                }
            }
        }

        self.argmax = argmax;
        self.input_shape = Some(input.shape());
        self.output = Some(B::new(out.into_dyn()));
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let (shape, output) = match (&self.input_shape, &self.output) {
            (Some(shape), Some(output)) => (shape, output),
            _ => return Err(NetError::not_forwarded(&self.name)),
        };
        check_gradient(&self.name, &output.shape(), &gradient.shape())?;

        let mut dx = vec![T::zero(); shape.iter().product()];
        for (&flat, &g) in self.argmax.iter().zip(gradient.iter()) {
            dx[flat] += g;
        }
        self.input_grad = Some(B::from_shape_vec(shape, dx)?);
        Ok(())
    }

    fn output(&self) -> Option<&B> {
        self.output.as_ref()
    }

    fn input_gradient(&self) -> Option<&B> {
        self.input_grad.as_ref()
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let g = pool_geometry(&self.name, input_shape, self.pool, self.stride, self.padding)?;
        Ok(vec![g.batch, g.out_h, g.out_w, g.channels])
    }
}

/// Average pooling; padded positions are excluded from the average.
pub struct AveragePooling2D<T, B> {
    name: String,
    pool: (usize, usize),
    stride: (usize, usize),
    padding: Padding,
    geometry: Option<ConvGeometry>,
    output: Option<B>,
    input_grad: Option<B>,
    dtype: std::marker::PhantomData<T>,
}

impl<T: Scalar, B: Tensor<T>> AveragePooling2D<T, B> {
    pub fn new(pool: (usize, usize)) -> Result<Self> {
        Self::with_stride(pool, pool, Padding::Valid)
    }

    pub fn with_stride(pool: (usize, usize), stride: (usize, usize), padding: Padding) -> Result<Self> {
        check_window("average_pooling2d", pool, stride, (1, 1))?;
        Ok(Self {
            name: "average_pooling2d".to_string(),
            pool,
            stride,
            padding,
            geometry: None,
            output: None,
            input_grad: None,
            dtype: std::marker::PhantomData,
        })
    }

    fn window(g: &ConvGeometry, oi: usize, oj: usize) -> Vec<(usize, usize)> {
        let mut cells = Vec::with_capacity(g.kernel.0 * g.kernel.1);
        for ki in 0..g.kernel.0 {
            let Some(r) = g.source_row(oi, ki) else { continue };
            for kj in 0..g.kernel.1 {
                if let Some(c) = g.source_col(oj, kj) {
                    cells.push((r, c));
                }
            }
        }
        cells
    }
}

impl<T: Scalar, B: Tensor<T>> Layer<T, B> for AveragePooling2D<T, B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &B) -> Result<()> {
        let g = pool_geometry(&self.name, &input.shape(), self.pool, self.stride, self.padding)?;
        let x = view4(input, &self.name)?;
        let mut out = Array4::<T>::zeros((g.batch, g.out_h, g.out_w, g.channels));

        for oi in 0..g.out_h {
            for oj in 0..g.out_w {
                let cells = Self::window(&g, oi, oj);
                let count = T::from_usize_lossy(cells.len().max(1));
                for n in 0..g.batch {
                    for ch in 0..g.channels {
                        let sum = cells.iter().fold(T::zero(), |acc, &(r, c)| acc + x[[n, r, c, ch]]);
                        out[[n, oi, oj, ch]] = sum / count;
                    }
                }
            }
        }

        self.geometry = Some(g);
        self.output = Some(B::new(out.into_dyn()));
        Ok(())
    }

    fn backward(&mut self, gradient: &B) -> Result<()> {
        let (g, output) = match (&self.geometry, &self.output) {
            (Some(g), Some(output)) => (*g, output),
            _ => return Err(NetError::not_forwarded(&self.name)),
        };
        check_gradient(&self.name, &output.shape(), &gradient.shape())?;

        let dy = gradient
            .get_data()
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|_| NetError::invalid("average pooling gradient must be rank 4"))?;
        let mut dx = Array4::<T>::zeros((g.batch, g.in_h, g.in_w, g.channels));
        for oi in 0..g.out_h {
            for oj in 0..g.out_w {
                let cells = Self::window(&g, oi, oj);
                let count = T::from_usize_lossy(cells.len().max(1));
                for n in 0..g.batch {
                    for ch in 0..g.channels {
                        let share = dy[[n, oi, oj, ch]] / count;
                        for &(r, c) in &cells {
                            dx[[n, r, c, ch]] += share;
                        }
                    }
                }
            }
        }
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
        let g = pool_geometry(&self.name, input_shape, self.pool, self.stride, self.padding)?;
        Ok(vec![g.batch, g.out_h, g.out_w, g.channels])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use ndarray::array;

    #[test]
    fn test_max_pooling_routes_gradient_to_winner() {
        let x = CpuTensor::new(
            array![[0.321, 0.542, 0.876], [0.056, 0.0312, 0.432], [0.432, 0.654, 0.192]]
                .into_shape((1, 3, 3, 1))
                .unwrap()
                .into_dyn(),
        );
        let mut pool = MaxPooling2D::<f64, CpuTensor<f64>>::new((3, 3)).unwrap();
        pool.forward(&x).unwrap();
        let out = pool.output().unwrap();
        assert_eq!(out.shape(), vec![1, 1, 1, 1]);
        assert_eq!(out.get_data()[[0, 0, 0, 0]], 0.876);

        pool.backward(&CpuTensor::ones(&[1, 1, 1, 1])).unwrap();
        let dx = pool.input_gradient().unwrap().reshape(&[3, 3]).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if (i, j) == (0, 2) { 1.0 } else { 0.0 };
                assert_eq!(dx.get_data()[[i, j]], expected);
            }
        }
    }

    #[test]
    fn test_max_pooling_same_padding_ignores_padded_cells() {
        let x = CpuTensor::new(array![[-1.0, -2.0, -3.0], [-4.0, -5.0, -6.0]].into_shape((1, 2, 3, 1)).unwrap().into_dyn());
        let mut pool = MaxPooling2D::<f64, CpuTensor<f64>>::with_stride((2, 2), (2, 2), Padding::Same).unwrap();
        pool.forward(&x).unwrap();
        let out = pool.output().unwrap();
        assert_eq!(out.shape(), vec![1, 1, 2, 1]);
        // padding would be zero and beat every negative input
        assert_eq!(out.get_data().iter().copied().collect::<Vec<_>>(), vec![-1.0, -3.0]);
    }

    #[test]
    fn test_average_pooling_spreads_gradient() {
        let x = CpuTensor::new(array![[1.0, 2.0], [3.0, 6.0]].into_shape((1, 2, 2, 1)).unwrap().into_dyn());
        let mut pool = AveragePooling2D::<f64, CpuTensor<f64>>::new((2, 2)).unwrap();
        pool.forward(&x).unwrap();
        assert_eq!(pool.output().unwrap().get_data()[[0, 0, 0, 0]], 3.0);

        pool.backward(&CpuTensor::full(&[1, 1, 1, 1], 2.0)).unwrap();
        assert!(pool.input_gradient().unwrap().iter().all(|&g| g == 0.5));
    }

    #[test]
    fn test_pooling_rejects_rank_two_input() {
        let pool = MaxPooling2D::<f32, CpuTensor<f32>>::new((2, 2)).unwrap();
        assert!(pool.output_shape(&[4, 4]).is_err());
        assert!(MaxPooling2D::<f32, CpuTensor<f32>>::new((0, 2)).is_err());
    }
}
