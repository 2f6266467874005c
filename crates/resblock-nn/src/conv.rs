use rayon::prelude::*;
use resblock_core::Tensor;
use tracing::debug;

use crate::error::{BlockError, NnResult};
use crate::layers::{nhwc, Layer, Mode, Param};

/// 2D convolution with unit stride and "same" padding.
///
/// Input shape:  [batch, height, width, in_channels]
/// Output shape: [batch, height, width, filters]
///
/// The kernel is laid out as `[kh, kw, in_channels, filters]`. Rows/columns
/// that do not fit evenly are padded on the bottom/right, so even kernels keep
/// the spatial size too. Parameters are created on the first forward pass (or
/// by [`Conv2D::build`]) once the input channel count is known.
#[derive(Debug, Clone)]
pub struct Conv2D {
    pub filters: usize,
    pub kernel_size: (usize, usize),
    pub use_bias: bool,
    seed: u64,
    in_channels: Option<usize>,
    kernel: Option<Param>,
    bias: Option<Param>,
    input: Option<Tensor<f64>>,
}

impl Conv2D {
    pub fn new(filters: usize, kernel_size: (usize, usize), use_bias: bool, seed: u64) -> NnResult<Self> {
        if filters == 0 {
            return Err(BlockError::Configuration("filters must be positive".to_string()));
        }
        if kernel_size.0 == 0 || kernel_size.1 == 0 {
            return Err(BlockError::Configuration(format!(
                "kernel dimensions must be positive, got {:?}",
                kernel_size
            )));
        }
        Ok(Conv2D {
            filters,
            kernel_size,
            use_bias,
            seed,
            in_channels: None,
            kernel: None,
            bias: None,
            input: None,
        })
    }

    pub fn in_channels(&self) -> Option<usize> {
        self.in_channels
    }

    /// Create the kernel (Glorot-uniform) and bias (zeros) for `in_channels`.
    ///
    /// Calling it again with the same channel count is a no-op.
    pub fn build(&mut self, in_channels: usize) -> NnResult<()> {
        if let Some(expected) = self.in_channels {
            if expected != in_channels {
                return Err(BlockError::InputChannels { expected, got: in_channels });
            }
            return Ok(());
        }
        if in_channels == 0 {
            return Err(BlockError::Configuration(
                "convolution input must have at least one channel".to_string(),
            ));
        }

        let (kh, kw) = self.kernel_size;
        let fan_in = kh * kw * in_channels;
        let fan_out = kh * kw * self.filters;
        let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
        let kernel = Tensor::uniform(
            vec![kh, kw, in_channels, self.filters],
            -limit,
            limit,
            Some(self.seed),
        );
        debug!(
            in_channels,
            filters = self.filters,
            kh,
            kw,
            use_bias = self.use_bias,
            "building Conv2D parameters"
        );

        self.kernel = Some(Param::new("kernel", kernel));
        if self.use_bias {
            self.bias = Some(Param::new("bias", Tensor::zeros(vec![self.filters])));
        }
        self.in_channels = Some(in_channels);
        Ok(())
    }

    /// Top and left padding; the remainder goes bottom and right.
    fn pad_before(&self) -> (usize, usize) {
        ((self.kernel_size.0 - 1) / 2, (self.kernel_size.1 - 1) / 2)
    }

    pub fn kernel(&self) -> Option<&Param> {
        self.kernel.as_ref()
    }

    pub fn bias(&self) -> Option<&Param> {
        self.bias.as_ref()
    }
}

/// Input coordinate feeding output coordinate `o` through kernel tap `k`.
#[inline]
fn source_index(o: usize, k: usize, pad: usize, extent: usize) -> Option<usize> {
    (o + k).checked_sub(pad).filter(|&i| i < extent)
}

impl Layer for Conv2D {
    fn forward(&mut self, input: &Tensor<f64>, _mode: Mode) -> NnResult<Tensor<f64>> {
        let (batch, h, w, c) = nhwc(input)?;
        self.build(c)?;
        let kernel = self.kernel.as_ref().ok_or(BlockError::NotBuilt("Conv2D"))?;

        let f = self.filters;
        let (kh, kw) = self.kernel_size;
        let (pt, pl) = self.pad_before();
        let x = input.data();
        let k = kernel.value.data();
        let bias = self.bias.as_ref().map(|b| b.value.data());

        let mut output = vec![0.0f64; batch * h * w * f];
        let plane = h * w * f;
        if plane > 0 {
            output
                .par_chunks_mut(plane)
                .enumerate()
                .for_each(|(n, out_n)| {
                    let x_n = &x[n * h * w * c..(n + 1) * h * w * c];
                    for oy in 0..h {
                        for ox in 0..w {
                            let o = &mut out_n[(oy * w + ox) * f..(oy * w + ox + 1) * f];
                            if let Some(b) = bias {
                                o.copy_from_slice(b);
                            }
                            for ky in 0..kh {
                                let Some(iy) = source_index(oy, ky, pt, h) else { continue };
                                for kx in 0..kw {
                                    let Some(ix) = source_index(ox, kx, pl, w) else { continue };
                                    let pixel = &x_n[(iy * w + ix) * c..(iy * w + ix + 1) * c];
                                    let tap = (ky * kw + kx) * c * f;
                                    for (ci, &xv) in pixel.iter().enumerate() {
                                        let row = &k[tap + ci * f..tap + (ci + 1) * f];
                                        for (ov, &kv) in o.iter_mut().zip(row) {
                                            *ov += xv * kv;
                                        }
                                    }
                                }
                            }
                        }
                    }
                });
        }

        self.input = Some(input.clone());
        Ok(Tensor::new(output, vec![batch, h, w, f])?)
    }

    fn backward(&mut self, grad_output: &Tensor<f64>) -> NnResult<Tensor<f64>> {
        let input = self.input.as_ref().ok_or(BlockError::NoForwardCache("Conv2D"))?;
        let (batch, h, w, c) = nhwc(input)?;
        let f = self.filters;
        if grad_output.shape_vec() != vec![batch, h, w, f] {
            return Err(BlockError::Tensor(resblock_core::TensorError::ShapeMismatch {
                expected: vec![batch, h, w, f],
                got: grad_output.shape_vec(),
            }));
        }

        let (kh, kw) = self.kernel_size;
        let (pt, pl) = self.pad_before();
        let x = input.data();
        let g = grad_output.data();
        let kernel = self.kernel.as_mut().ok_or(BlockError::NotBuilt("Conv2D"))?;

        // Input gradient, one batch item per task.
        let k = kernel.value.data();
        let mut grad_input = vec![0.0f64; batch * h * w * c];
        let plane = h * w * c;
        if plane > 0 {
            grad_input
                .par_chunks_mut(plane)
                .enumerate()
                .for_each(|(n, dx_n)| {
                    let g_n = &g[n * h * w * f..(n + 1) * h * w * f];
                    for oy in 0..h {
                        for ox in 0..w {
                            let go = &g_n[(oy * w + ox) * f..(oy * w + ox + 1) * f];
                            for ky in 0..kh {
                                let Some(iy) = source_index(oy, ky, pt, h) else { continue };
                                for kx in 0..kw {
                                    let Some(ix) = source_index(ox, kx, pl, w) else { continue };
                                    let tap = (ky * kw + kx) * c * f;
                                    let dx = &mut dx_n[(iy * w + ix) * c..(iy * w + ix + 1) * c];
                                    for (ci, d) in dx.iter_mut().enumerate() {
                                        let row = &k[tap + ci * f..tap + (ci + 1) * f];
                                        *d += row.iter().zip(go).map(|(&kv, &gv)| kv * gv).sum::<f64>();
                                    }
                                }
                            }
                        }
                    }
                });
        }

        let dk = kernel.grad.data_mut();
        for n in 0..batch {
            for oy in 0..h {
                for ox in 0..w {
                    let go = &g[((n * h + oy) * w + ox) * f..((n * h + oy) * w + ox + 1) * f];
                    for ky in 0..kh {
                        let Some(iy) = source_index(oy, ky, pt, h) else { continue };
                        for kx in 0..kw {
                            let Some(ix) = source_index(ox, kx, pl, w) else { continue };
                            let pixel = &x[((n * h + iy) * w + ix) * c..((n * h + iy) * w + ix + 1) * c];
                            let tap = (ky * kw + kx) * c * f;
                            for (ci, &xv) in pixel.iter().enumerate() {
                                let row = &mut dk[tap + ci * f..tap + (ci + 1) * f];
                                for (d, &gv) in row.iter_mut().zip(go) {
                                    *d += xv * gv;
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(bias) = self.bias.as_mut() {
            let sums = grad_output.sum_channels()?;
            for (d, s) in bias.grad.data_mut().iter_mut().zip(sums) {
                *d += s;
            }
        }

        Ok(Tensor::new(grad_input, vec![batch, h, w, c])?)
    }

    fn parameters(&self) -> Vec<&Param> {
        self.kernel.iter().chain(self.bias.iter()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.kernel.iter_mut().chain(self.bias.iter_mut()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn set_kernel(conv: &mut Conv2D, in_channels: usize, values: Vec<f64>) {
        conv.build(in_channels).unwrap();
        let (kh, kw) = conv.kernel_size;
        let t = Tensor::new(values, vec![kh, kw, in_channels, conv.filters]).unwrap();
        conv.parameters_mut()[0].assign(t).unwrap();
    }

    #[test]
    fn test_same_padding_shapes() {
        let x = Tensor::randn(vec![2, 5, 7, 3], Some(1));
        for ks in [(3, 3), (2, 2), (1, 5), (4, 1), (5, 5)] {
            let mut conv = Conv2D::new(4, ks, true, 42).unwrap();
            let y = conv.forward(&x, Mode::Eval).unwrap();
            assert_eq!(y.shape_vec(), vec![2, 5, 7, 4], "kernel {:?}", ks);
        }
    }

    #[test]
    fn test_ones_kernel_counts_neighbours() {
        let mut conv = Conv2D::new(1, (3, 3), false, 0).unwrap();
        set_kernel(&mut conv, 1, vec![1.0; 9]);
        let x = Tensor::ones(vec![1, 3, 3, 1]);
        let y = conv.forward(&x, Mode::Eval).unwrap();
        assert_eq!(y.data(), &[4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_even_kernel_pads_bottom_right() {
        let mut conv = Conv2D::new(1, (2, 2), false, 0).unwrap();
        set_kernel(&mut conv, 1, vec![1.0; 4]);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 2, 2, 1]).unwrap();
        let y = conv.forward(&x, Mode::Eval).unwrap();
        assert_eq!(y.data(), &[10.0, 6.0, 7.0, 4.0]);
    }

    #[test]
    fn test_bias_and_channels() {
        let mut conv = Conv2D::new(2, (1, 1), true, 0).unwrap();
        // kernel [1, 1, 2, 2]: out0 = x0 + x1, out1 = x0 - x1
        set_kernel(&mut conv, 2, vec![1.0, 1.0, 1.0, -1.0]);
        conv.parameters_mut()[1].assign(Tensor::new(vec![0.5, -0.5], vec![2]).unwrap()).unwrap();
        let x = Tensor::new(vec![3.0, 1.0], vec![1, 1, 1, 2]).unwrap();
        let y = conv.forward(&x, Mode::Eval).unwrap();
        assert_eq!(y.data(), &[4.5, 1.5]);
    }

    #[test]
    fn test_no_bias_has_single_param() {
        let mut conv = Conv2D::new(3, (3, 3), false, 0).unwrap();
        assert!(conv.parameters().is_empty());
        conv.build(2).unwrap();
        let params = conv.parameters();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name(), "kernel");
        assert_eq!(params[0].shape_vec(), vec![3, 3, 2, 3]);
    }

    #[test]
    fn test_glorot_bounds_and_seed() {
        let mut a = Conv2D::new(4, (3, 3), true, 9).unwrap();
        let mut b = Conv2D::new(4, (3, 3), true, 9).unwrap();
        a.build(1).unwrap();
        b.build(1).unwrap();
        let limit = (6.0f64 / (9.0 + 36.0)).sqrt();
        let k = &a.kernel().unwrap().value;
        assert!(k.max_all().unwrap() < limit);
        assert!(k.min_all().unwrap() >= -limit);
        assert_eq!(k, &b.kernel().unwrap().value);
        assert_eq!(a.bias().unwrap().value.sum_all(), 0.0);
    }

    #[test]
    fn test_channel_count_fixed_after_build() {
        let mut conv = Conv2D::new(2, (3, 3), true, 0).unwrap();
        conv.forward(&Tensor::zeros(vec![1, 4, 4, 3]), Mode::Train).unwrap();
        let err = conv.forward(&Tensor::zeros(vec![1, 4, 4, 2]), Mode::Train).unwrap_err();
        assert!(matches!(err, BlockError::InputChannels { expected: 3, got: 2 }));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(Conv2D::new(0, (3, 3), true, 0), Err(BlockError::Configuration(_))));
        assert!(matches!(Conv2D::new(1, (0, 3), true, 0), Err(BlockError::Configuration(_))));
        assert!(matches!(Conv2D::new(1, (3, 0), true, 0), Err(BlockError::Configuration(_))));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let x = Tensor::randn(vec![2, 4, 3, 2], Some(5));
        let upstream = Tensor::randn(vec![2, 4, 3, 3], Some(6));
        let mut conv = Conv2D::new(3, (3, 2), true, 11).unwrap();

        let loss = |conv: &mut Conv2D, x: &Tensor<f64>| -> f64 {
            let y = conv.forward(x, Mode::Train).unwrap();
            y.mul(&upstream).unwrap().sum_all()
        };

        loss(&mut conv, &x);
        let dx = conv.backward(&upstream).unwrap();
        let dk = conv.kernel().unwrap().grad.clone();
        let db = conv.bias().unwrap().grad.clone();

        let eps = 1e-6;
        for i in [0, 7, 19, 40] {
            let mut xp = x.clone();
            xp.data_mut()[i] += eps;
            let mut xm = x.clone();
            xm.data_mut()[i] -= eps;
            let numeric = (loss(&mut conv, &xp) - loss(&mut conv, &xm)) / (2.0 * eps);
            assert_abs_diff_eq!(dx.data()[i], numeric, epsilon = 1e-5);
        }

        for i in [0, 5, 17, 35] {
            let base = conv.kernel().unwrap().value.clone();
            let mut kp = base.clone();
            kp.data_mut()[i] += eps;
            conv.parameters_mut()[0].assign(kp).unwrap();
            let lp = loss(&mut conv, &x);
            let mut km = base.clone();
            km.data_mut()[i] -= eps;
            conv.parameters_mut()[0].assign(km).unwrap();
            let lm = loss(&mut conv, &x);
            conv.parameters_mut()[0].assign(base).unwrap();
            assert_abs_diff_eq!(dk.data()[i], (lp - lm) / (2.0 * eps), epsilon = 1e-5);
        }

        let upstream_sums = upstream.sum_channels().unwrap();
        for (d, s) in db.data().iter().zip(upstream_sums) {
            assert_abs_diff_eq!(*d, s, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_backward_requires_forward() {
        let mut conv = Conv2D::new(1, (3, 3), true, 0).unwrap();
        let err = conv.backward(&Tensor::zeros(vec![1, 2, 2, 1])).unwrap_err();
        assert!(matches!(err, BlockError::NoForwardCache("Conv2D")));
    }
}
