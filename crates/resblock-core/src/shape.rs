use crate::error::{TensorError, TensorResult};
use serde::{Deserialize, Serialize};

/// Axis holding channels in an NHWC feature map.
pub const CHANNEL_AXIS: usize = 3;

/// Represents the shape of a tensor (dimensions).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Size along a specific axis.
    pub fn dim(&self, axis: usize) -> TensorResult<usize> {
        self.dims.get(axis).copied().ok_or(TensorError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.dims.clone()
    }

    /// Compute row-major (C-order) strides.
    pub fn strides(&self) -> Vec<usize> {
        if self.dims.is_empty() {
            return vec![];
        }
        let mut strides = vec![1usize; self.dims.len()];
        for i in (0..self.dims.len() - 1).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Copy of this shape with one axis resized.
    pub fn with_dim(&self, axis: usize, size: usize) -> TensorResult<Shape> {
        let mut dims = self.dims.clone();
        let slot = dims.get_mut(axis).ok_or(TensorError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })?;
        *slot = size;
        Ok(Shape::new(dims))
    }

    /// Split into `(outer, axis, inner)` extents around `axis`.
    ///
    /// Row-major data is then `outer` blocks of `axis * inner` contiguous values.
    pub fn split_at_axis(&self, axis: usize) -> TensorResult<(usize, usize, usize)> {
        let size = self.dim(axis)?;
        let outer = self.dims[..axis].iter().product();
        let inner = self.dims[axis + 1..].iter().product();
        Ok((outer, size, inner))
    }

    /// Interpret as an NHWC feature map: `(batch, height, width, channels)`.
    pub fn nhwc(&self) -> TensorResult<(usize, usize, usize, usize)> {
        match self.dims.as_slice() {
            &[b, h, w, c] => Ok((b, h, w, c)),
            _ => Err(TensorError::DimensionMismatch(format!(
                "expected a rank-4 (batch, height, width, channels) tensor, got shape {}",
                self
            ))),
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}
