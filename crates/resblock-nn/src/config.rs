use serde::{Deserialize, Serialize};

use crate::error::{BlockError, NnResult};
use crate::norm::{DEFAULT_EPSILON, DEFAULT_MOMENTUM};

/// Construction-time settings of a [`ResidualBlock`](crate::ResidualBlock).
///
/// Both convolution stages share `filters` and `kernel_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidualBlockConfig {
    pub filters: usize,
    pub kernel_size: (usize, usize),
    pub use_bias: bool,
    /// Running-average momentum of both normalization stages.
    pub momentum: f64,
    /// Variance offset of both normalization stages.
    pub epsilon: f64,
    /// Seed of the first stage's kernel; the second stage derives its own.
    pub seed: u64,
}

impl Default for ResidualBlockConfig {
    fn default() -> Self {
        ResidualBlockConfig {
            filters: 4,
            kernel_size: (3, 3),
            use_bias: true,
            momentum: DEFAULT_MOMENTUM,
            epsilon: DEFAULT_EPSILON,
            seed: 42,
        }
    }
}

impl ResidualBlockConfig {
    pub fn new(filters: usize, kernel_size: (usize, usize), use_bias: bool) -> Self {
        ResidualBlockConfig {
            filters,
            kernel_size,
            use_bias,
            ..Default::default()
        }
    }

    pub fn with_filters(mut self, filters: usize) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_kernel_size(mut self, kh: usize, kw: usize) -> Self {
        self.kernel_size = (kh, kw);
        self
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> NnResult<()> {
        if self.filters == 0 {
            return Err(BlockError::Configuration("filters must be positive".to_string()));
        }
        if self.kernel_size.0 == 0 || self.kernel_size.1 == 0 {
            return Err(BlockError::Configuration(format!(
                "kernel dimensions must be positive, got {:?}",
                self.kernel_size
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(BlockError::Configuration(format!(
                "momentum must lie in [0, 1), got {}",
                self.momentum
            )));
        }
        if !(self.epsilon > 0.0 && self.epsilon.is_finite()) {
            return Err(BlockError::Configuration(format!(
                "epsilon must be positive and finite, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }

    /// Seed of the second stage's kernel.
    pub(crate) fn second_stage_seed(&self) -> u64 {
        self.seed.wrapping_add(0x9E37_79B9_7F4A_7C15)
    }
}
