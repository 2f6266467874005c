//! Shortcut merge of a residual block.
//!
//! The shortcut and the transformed path may disagree only in their channel
//! count. The side with fewer channels receives trailing zero channels, then
//! both are summed element-wise. Batch, height and width are never touched, so
//! any disagreement there is a [`BlockError::ShapeMismatch`].

use resblock_core::shape::CHANNEL_AXIS;
use resblock_core::Tensor;
use tracing::trace;

use crate::error::{BlockError, NnResult};
use crate::layers::nhwc;

/// Trailing zero channels to append to each side so both reach
/// `max(a_channels, b_channels)`.
pub fn reconcile(a_channels: usize, b_channels: usize) -> (usize, usize) {
    (b_channels.saturating_sub(a_channels), a_channels.saturating_sub(b_channels))
}

/// Append `extra` zero-valued channels to an NHWC tensor.
pub fn pad_channels(tensor: &Tensor<f64>, extra: usize) -> NnResult<Tensor<f64>> {
    nhwc(tensor)?;
    Ok(tensor.pad_axis(CHANNEL_AXIS, extra, 0.0)?)
}

/// Pad the shortcut and the transformed path to a common channel count.
pub fn align(shortcut: &Tensor<f64>, transformed: &Tensor<f64>) -> NnResult<(Tensor<f64>, Tensor<f64>)> {
    let (_, _, _, c_in) = nhwc(shortcut)?;
    let (_, _, _, c_out) = nhwc(transformed)?;
    let (pad_shortcut, pad_transformed) = reconcile(c_in, c_out);
    trace!(c_in, c_out, pad_shortcut, pad_transformed, "reconciling residual channels");
    Ok((
        pad_channels(shortcut, pad_shortcut)?,
        pad_channels(transformed, pad_transformed)?,
    ))
}

/// Align both operands and sum them.
pub fn merge(shortcut: &Tensor<f64>, transformed: &Tensor<f64>) -> NnResult<Tensor<f64>> {
    let (shortcut, transformed) = align(shortcut, transformed)?;
    if shortcut.shape() != transformed.shape() {
        return Err(BlockError::ShapeMismatch {
            shortcut: shortcut.shape_vec(),
            transformed: transformed.shape_vec(),
        });
    }
    Ok(shortcut.add(&transformed)?)
}

/// Route the gradient of a merged sum back to each operand by dropping the
/// channels that were padded onto it.
pub fn split_gradient(
    grad_sum: &Tensor<f64>,
    shortcut_channels: usize,
    transformed_channels: usize,
) -> NnResult<(Tensor<f64>, Tensor<f64>)> {
    let (_, _, _, c) = nhwc(grad_sum)?;
    if c != shortcut_channels.max(transformed_channels) {
        return Err(BlockError::Tensor(resblock_core::TensorError::DimensionMismatch(format!(
            "merged gradient has {} channels, expected {}",
            c,
            shortcut_channels.max(transformed_channels)
        ))));
    }
    Ok((
        grad_sum.slice_axis(CHANNEL_AXIS, 0, shortcut_channels)?,
        grad_sum.slice_axis(CHANNEL_AXIS, 0, transformed_channels)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile() {
        assert_eq!(reconcile(1, 4), (3, 0));
        assert_eq!(reconcile(4, 2), (0, 2));
        assert_eq!(reconcile(3, 3), (0, 0));
        assert_eq!(reconcile(0, 5), (5, 0));
    }

    #[test]
    fn test_reconcile_reaches_common_width() {
        for a in 0..6 {
            for b in 0..6 {
                let (pa, pb) = reconcile(a, b);
                assert_eq!(a + pa, a.max(b));
                assert_eq!(b + pb, a.max(b));
                assert!(pa == 0 || pb == 0);
            }
        }
    }

    #[test]
    fn test_align_pads_transformed_with_zeros() {
        let shortcut = Tensor::full(vec![2, 3, 3, 4], 1.0);
        let transformed = Tensor::randn(vec![2, 3, 3, 2], Some(4));
        let (s, t) = align(&shortcut, &transformed).unwrap();
        assert_eq!(s, shortcut);
        assert_eq!(t.shape_vec(), vec![2, 3, 3, 4]);
        assert_eq!(t.slice_axis(3, 0, 2).unwrap(), transformed);
        assert!(t.slice_axis(3, 2, 4).unwrap().data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_align_pads_shortcut_with_zeros() {
        let shortcut = Tensor::full(vec![1, 2, 2, 1], 3.0);
        let transformed = Tensor::full(vec![1, 2, 2, 4], 1.0);
        let (s, t) = align(&shortcut, &transformed).unwrap();
        assert_eq!(t, transformed);
        assert_eq!(s.shape_vec(), vec![1, 2, 2, 4]);
        for pixel in s.data().chunks_exact(4) {
            assert_eq!(pixel, &[3.0, 0.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn test_merge_sums_padded_operands() {
        let shortcut = Tensor::new(vec![1.0, 2.0], vec![1, 1, 1, 2]).unwrap();
        let transformed = Tensor::new(vec![10.0, 20.0, 30.0], vec![1, 1, 1, 3]).unwrap();
        let sum = merge(&shortcut, &transformed).unwrap();
        assert_eq!(sum.data(), &[11.0, 22.0, 30.0]);
    }

    #[test]
    fn test_merge_rejects_spatial_mismatch() {
        let shortcut: Tensor<f64> = Tensor::zeros(vec![1, 4, 4, 2]);
        let transformed: Tensor<f64> = Tensor::zeros(vec![1, 2, 2, 4]);
        match merge(&shortcut, &transformed) {
            Err(BlockError::ShapeMismatch { shortcut, transformed }) => {
                assert_eq!(shortcut, vec![1, 4, 4, 4]);
                assert_eq!(transformed, vec![1, 2, 2, 4]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_rejects_batch_mismatch() {
        let shortcut: Tensor<f64> = Tensor::zeros(vec![2, 3, 3, 1]);
        let transformed: Tensor<f64> = Tensor::zeros(vec![1, 3, 3, 1]);
        assert!(matches!(merge(&shortcut, &transformed), Err(BlockError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_merge_rejects_non_feature_maps() {
        let shortcut: Tensor<f64> = Tensor::zeros(vec![3, 3]);
        let transformed: Tensor<f64> = Tensor::zeros(vec![1, 3, 3, 1]);
        assert!(matches!(merge(&shortcut, &transformed), Err(BlockError::InvalidInput { .. })));
    }

    #[test]
    fn test_split_gradient() {
        let grad = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 1, 1, 4]).unwrap();
        let (gs, gt) = split_gradient(&grad, 1, 4).unwrap();
        assert_eq!(gs.data(), &[1.0]);
        assert_eq!(gt, grad);
        assert!(split_gradient(&grad, 1, 2).is_err());
    }
}
