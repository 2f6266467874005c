//! # resblock
//!
//! A residual convolutional block over NHWC feature maps, written in pure Rust.
//!
//! ## Modules
//!
//! - **core** — Tensor engine: N-dimensional arrays, channel padding and slicing
//! - **nn** — Conv2D, BatchNorm2D, ReLU, the residual block and its shortcut merge
//!
//! ```
//! use resblock::core::Tensor;
//! use resblock::nn::{Layer, Mode, ResidualBlock, ResidualBlockConfig};
//!
//! let mut block = ResidualBlock::new(ResidualBlockConfig::default()).unwrap();
//! let x = Tensor::randn(vec![2, 28, 28, 1], Some(0));
//! let y = block.forward(&x, Mode::Eval).unwrap();
//! assert_eq!(y.shape_vec(), vec![2, 28, 28, 4]);
//! ```

/// Core tensor engine.
pub use resblock_core as core;

/// Residual block and layer primitives.
pub use resblock_nn as nn;

pub use resblock_core::Tensor;
pub use resblock_nn::{BlockError, Layer, Mode, ResidualBlock, ResidualBlockConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Sequential;

    fn squared_error(y: &Tensor<f64>, target: &Tensor<f64>) -> (f64, Tensor<f64>) {
        let diff = y.sub(target).unwrap();
        (0.5 * diff.mul(&diff).unwrap().sum_all(), diff)
    }

    #[test]
    fn test_gradient_step_reduces_loss() {
        let mut model = Sequential::new()
            .add(Box::new(ResidualBlock::new(ResidualBlockConfig::default()).unwrap()))
            .add(Box::new(ResidualBlock::new(ResidualBlockConfig::default().with_seed(3)).unwrap()));
        let x = Tensor::randn(vec![4, 6, 6, 1], Some(10));
        let target = Tensor::randn(vec![4, 6, 6, 4], Some(11)).relu();

        let y = model.forward(&x, Mode::Train).unwrap();
        let (before, grad) = squared_error(&y, &target);
        model.zero_grad();
        model.backward(&grad).unwrap();

        let lr = 1e-4;
        for p in model.parameters_mut() {
            let step = p.grad.mul_scalar(-lr);
            p.value.add_assign(&step).unwrap();
        }

        let y = model.forward(&x, Mode::Train).unwrap();
        let (after, _) = squared_error(&y, &target);
        assert!(after < before, "loss went from {} to {}", before, after);
    }

    #[test]
    fn test_digit_sized_input() {
        let mut block = ResidualBlock::new(ResidualBlockConfig::default()).unwrap();
        let x = Tensor::rand(vec![3, 28, 28, 1], Some(5));
        let y = block.forward(&x, Mode::Train).unwrap();
        assert_eq!(y.shape_vec(), vec![3, 28, 28, 4]);
        assert!(y.min_all().unwrap() >= 0.0);
    }

    #[test]
    fn test_errors_surface_to_caller() {
        let err = ResidualBlock::new(ResidualBlockConfig::default().with_filters(0)).unwrap_err();
        assert!(err.to_string().contains("filters must be positive"));

        let shortcut: Tensor<f64> = Tensor::zeros(vec![1, 5, 5, 1]);
        let transformed: Tensor<f64> = Tensor::zeros(vec![1, 3, 3, 4]);
        let err = nn::merge(&shortcut, &transformed).unwrap_err();
        assert!(matches!(err, BlockError::ShapeMismatch { .. }));
    }
}
