use resblock_core::Tensor;
use tracing::debug;

use crate::error::{BlockError, NnResult};
use crate::layers::{nhwc, Layer, Mode, Param};

pub const DEFAULT_MOMENTUM: f64 = 0.99;
pub const DEFAULT_EPSILON: f64 = 1e-3;

/// Per-channel batch normalization over NHWC feature maps.
///
/// y = (x - μ) / √(σ² + ε) * γ + β
///
/// In [`Mode::Train`] μ and σ² are the statistics of the current batch (over
/// batch, height and width) and the running averages move towards them by
/// `1 - momentum`. In [`Mode::Eval`] the running averages are used and nothing
/// is updated.
#[derive(Debug, Clone)]
pub struct BatchNorm2D {
    pub momentum: f64,
    pub epsilon: f64,
    state: Option<NormState>,
    cache: Option<NormCache>,
}

#[derive(Debug, Clone)]
struct NormState {
    gamma: Param,
    beta: Param,
    moving_mean: Tensor<f64>,
    moving_variance: Tensor<f64>,
}

#[derive(Debug, Clone)]
struct NormCache {
    normalized: Tensor<f64>,
    inv_std: Vec<f64>,
    batch_statistics: bool,
}

impl BatchNorm2D {
    pub fn new(momentum: f64, epsilon: f64) -> NnResult<Self> {
        if !(0.0..1.0).contains(&momentum) {
            return Err(BlockError::Configuration(format!(
                "momentum must lie in [0, 1), got {}",
                momentum
            )));
        }
        if !(epsilon > 0.0 && epsilon.is_finite()) {
            return Err(BlockError::Configuration(format!(
                "epsilon must be positive and finite, got {}",
                epsilon
            )));
        }
        Ok(BatchNorm2D {
            momentum,
            epsilon,
            state: None,
            cache: None,
        })
    }

    pub fn channels(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.gamma.value.numel())
    }

    /// Create γ = 1, β = 0 and running statistics (mean 0, variance 1).
    pub fn build(&mut self, channels: usize) -> NnResult<()> {
        if let Some(expected) = self.channels() {
            if expected != channels {
                return Err(BlockError::InputChannels { expected, got: channels });
            }
            return Ok(());
        }
        debug!(channels, momentum = self.momentum, epsilon = self.epsilon, "building BatchNorm2D parameters");
        self.state = Some(NormState {
            gamma: Param::new("gamma", Tensor::ones(vec![channels])),
            beta: Param::new("beta", Tensor::zeros(vec![channels])),
            moving_mean: Tensor::zeros(vec![channels]),
            moving_variance: Tensor::ones(vec![channels]),
        });
        Ok(())
    }

    pub fn moving_mean(&self) -> Option<&Tensor<f64>> {
        self.state.as_ref().map(|s| &s.moving_mean)
    }

    pub fn moving_variance(&self) -> Option<&Tensor<f64>> {
        self.state.as_ref().map(|s| &s.moving_variance)
    }

    /// Overwrite the running statistics of a built layer.
    pub fn set_running_statistics(&mut self, mean: Tensor<f64>, variance: Tensor<f64>) -> NnResult<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| BlockError::StateMismatch("BatchNorm2D is not built".to_string()))?;
        for (name, current, new) in [
            ("moving_mean", &state.moving_mean, &mean),
            ("moving_variance", &state.moving_variance, &variance),
        ] {
            if current.shape() != new.shape() {
                return Err(BlockError::StateMismatch(format!(
                    "{}: expected shape {}, got {}",
                    name,
                    current.shape(),
                    new.shape()
                )));
            }
        }
        state.moving_mean = mean;
        state.moving_variance = variance;
        Ok(())
    }
}

impl Default for BatchNorm2D {
    fn default() -> Self {
        BatchNorm2D {
            momentum: DEFAULT_MOMENTUM,
            epsilon: DEFAULT_EPSILON,
            state: None,
            cache: None,
        }
    }
}

/// Per-channel mean and biased variance of an NHWC tensor.
fn channel_moments(x: &Tensor<f64>, channels: usize) -> NnResult<(Vec<f64>, Vec<f64>)> {
    let count = (x.numel() / channels) as f64;
    let mean: Vec<f64> = x.sum_channels()?.into_iter().map(|s| s / count).collect();
    let mut var = vec![0.0; channels];
    for pixel in x.data().chunks_exact(channels) {
        for ((v, &xv), &m) in var.iter_mut().zip(pixel).zip(&mean) {
            *v += (xv - m) * (xv - m);
        }
    }
    var.iter_mut().for_each(|v| *v /= count);
    Ok((mean, var))
}

impl Layer for BatchNorm2D {
    fn forward(&mut self, input: &Tensor<f64>, mode: Mode) -> NnResult<Tensor<f64>> {
        let (_, _, _, c) = nhwc(input)?;
        self.build(c)?;
        let momentum = self.momentum;
        let epsilon = self.epsilon;
        let state = self.state.as_mut().ok_or(BlockError::NotBuilt("BatchNorm2D"))?;

        let batch_statistics = mode.is_training() && input.numel() > 0;
        let (mean, var) = if batch_statistics {
            let (mean, var) = channel_moments(input, c)?;
            // The running variance tracks the unbiased estimate.
            let count = input.numel() / c;
            let correction = if count > 1 { count as f64 / (count - 1) as f64 } else { 1.0 };
            for (m, &bm) in state.moving_mean.data_mut().iter_mut().zip(&mean) {
                *m = *m * momentum + bm * (1.0 - momentum);
            }
            for (v, &bv) in state.moving_variance.data_mut().iter_mut().zip(&var) {
                *v = *v * momentum + bv * correction * (1.0 - momentum);
            }
            (mean, var)
        } else {
            (state.moving_mean.data().to_vec(), state.moving_variance.data().to_vec())
        };

        let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + epsilon).sqrt()).collect();
        let gamma = state.gamma.value.data();
        let beta = state.beta.value.data();

        let mut normalized = input.clone();
        let mut output = input.clone();
        if c > 0 {
            for (xhat, y) in normalized
                .data_mut()
                .chunks_exact_mut(c)
                .zip(output.data_mut().chunks_exact_mut(c))
            {
                for ch in 0..c {
                    xhat[ch] = (xhat[ch] - mean[ch]) * inv_std[ch];
                    y[ch] = xhat[ch] * gamma[ch] + beta[ch];
                }
            }
        }

        self.cache = Some(NormCache {
            normalized,
            inv_std,
            batch_statistics,
        });
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor<f64>) -> NnResult<Tensor<f64>> {
        let cache = self.cache.as_ref().ok_or(BlockError::NoForwardCache("BatchNorm2D"))?;
        let state = self.state.as_mut().ok_or(BlockError::NotBuilt("BatchNorm2D"))?;
        let xhat = &cache.normalized;
        if grad_output.shape() != xhat.shape() {
            return Err(BlockError::Tensor(resblock_core::TensorError::ShapeMismatch {
                expected: xhat.shape_vec(),
                got: grad_output.shape_vec(),
            }));
        }
        let c = cache.inv_std.len();

        let sum_g = grad_output.sum_channels()?;
        let sum_g_xhat = grad_output.mul(xhat)?.sum_channels()?;
        for (d, s) in state.gamma.grad.data_mut().iter_mut().zip(&sum_g_xhat) {
            *d += s;
        }
        for (d, s) in state.beta.grad.data_mut().iter_mut().zip(&sum_g) {
            *d += s;
        }

        let gamma = state.gamma.value.data();
        let mut grad_input = grad_output.clone();
        if c == 0 {
            return Ok(grad_input);
        }
        let count = (grad_output.numel() / c) as f64;
        for (dx, xh) in grad_input
            .data_mut()
            .chunks_exact_mut(c)
            .zip(xhat.data().chunks_exact(c))
        {
            for ch in 0..c {
                let scale = gamma[ch] * cache.inv_std[ch];
                dx[ch] = if cache.batch_statistics {
                    scale / count * (count * dx[ch] - sum_g[ch] - xh[ch] * sum_g_xhat[ch])
                } else {
                    scale * dx[ch]
                };
            }
        }
        Ok(grad_input)
    }

    fn parameters(&self) -> Vec<&Param> {
        match &self.state {
            Some(s) => vec![&s.gamma, &s.beta],
            None => vec![],
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        match &mut self.state {
            Some(s) => vec![&mut s.gamma, &mut s.beta],
            None => vec![],
        }
    }
}
