use crate::dtype::Float;
use crate::error::{TensorError, TensorResult};
use crate::shape::Shape;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

/// N-dimensional tensor holding feature maps and parameters.
///
/// Stores data in a flat contiguous `Vec<T>` with row-major (C-order) layout.
/// Feature maps use the NHWC convention: `(batch, height, width, channels)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct Tensor<T: Float> {
    data: Vec<T>,
    shape: Shape,
}

// ─── Construction ───────────────────────────────────────────────────────────

impl<T: Float> Tensor<T> {
    /// Create a tensor from raw data and shape.
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> TensorResult<Self> {
        let s = Shape::new(shape);
        if data.len() != s.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: s.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Tensor { data, shape: s })
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, T::ZERO)
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: Vec<usize>) -> Self {
        Self::full(shape, T::ONE)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: Vec<usize>, value: T) -> Self {
        let s = Shape::new(shape);
        Tensor {
            data: vec![value; s.numel()],
            shape: s,
        }
    }

    /// Zero tensor with the same shape as `other`.
    pub fn zeros_like(other: &Tensor<T>) -> Self {
        Tensor {
            data: vec![T::ZERO; other.numel()],
            shape: other.shape.clone(),
        }
    }

    /// Random tensor with uniform distribution in [0, 1).
    pub fn rand(shape: Vec<usize>, seed: Option<u64>) -> Self {
        Self::uniform(shape, T::ZERO, T::ONE, seed)
    }

    /// Random tensor with uniform distribution in [low, high).
    pub fn uniform(shape: Vec<usize>, low: T, high: T, seed: Option<u64>) -> Self {
        let s = Shape::new(shape);
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let span = high.to_f64() - low.to_f64();
        let data: Vec<T> = (0..s.numel())
            .map(|_| T::from_f64(low.to_f64() + span * rng.gen::<f64>()))
            .collect();
        Tensor { data, shape: s }
    }

    /// Random tensor with standard normal distribution (Box-Muller).
    pub fn randn(shape: Vec<usize>, seed: Option<u64>) -> Self {
        let s = Shape::new(shape);
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let n = s.numel();
        let mut data = Vec::with_capacity(n + 1);
        while data.len() < n {
            let u1: f64 = rng.gen::<f64>().max(1e-10);
            let u2: f64 = rng.gen::<f64>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f64::consts::PI * u2;
            data.push(T::from_f64(r * theta.cos()));
            data.push(T::from_f64(r * theta.sin()));
        }
        data.truncate(n);
        Tensor { data, shape: s }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn shape_vec(&self) -> Vec<usize> {
        self.shape.to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    fn offset(&self, indices: &[usize]) -> TensorResult<usize> {
        if indices.len() != self.ndim() {
            return Err(TensorError::DimensionMismatch(format!(
                "Expected {} indices, got {}",
                self.ndim(),
                indices.len()
            )));
        }
        let strides = self.shape.strides();
        let mut offset = 0;
        for (i, &idx) in indices.iter().enumerate() {
            let dim_size = self.shape.dim(i)?;
            if idx >= dim_size {
                return Err(TensorError::IndexOutOfBounds {
                    index: idx,
                    axis: i,
                    size: dim_size,
                });
            }
            offset += idx * strides[i];
        }
        Ok(offset)
    }

    /// Multi-dimensional indexing.
    pub fn get(&self, indices: &[usize]) -> TensorResult<T> {
        Ok(self.data[self.offset(indices)?])
    }

    /// Set a single element.
    pub fn set(&mut self, indices: &[usize], value: T) -> TensorResult<()> {
        let offset = self.offset(indices)?;
        self.data[offset] = value;
        Ok(())
    }

    // ─── Shape Manipulation ─────────────────────────────────────────────────

    /// Append `extra` entries filled with `value` at the end of `axis`.
    ///
    /// Every other axis keeps its extent; existing values keep their indices.
    pub fn pad_axis(&self, axis: usize, extra: usize, value: T) -> TensorResult<Tensor<T>> {
        let (outer, size, inner) = self.shape.split_at_axis(axis)?;
        if extra == 0 {
            return Ok(self.clone());
        }
        let shape = self.shape.with_dim(axis, size + extra)?;
        let block = size * inner;
        let mut data = Vec::with_capacity(shape.numel());
        for o in 0..outer {
            data.extend_from_slice(&self.data[o * block..(o + 1) * block]);
            data.extend(std::iter::repeat(value).take(extra * inner));
        }
        Ok(Tensor { data, shape })
    }

    /// Keep the entries `start..end` along `axis`.
    pub fn slice_axis(&self, axis: usize, start: usize, end: usize) -> TensorResult<Tensor<T>> {
        let (outer, size, inner) = self.shape.split_at_axis(axis)?;
        if start > end || end > size {
            return Err(TensorError::InvalidRange {
                axis,
                start,
                end,
                size,
            });
        }
        if start == 0 && end == size {
            return Ok(self.clone());
        }
        let shape = self.shape.with_dim(axis, end - start)?;
        let block = size * inner;
        let mut data = Vec::with_capacity(shape.numel());
        for o in 0..outer {
            let base = o * block;
            data.extend_from_slice(&self.data[base + start * inner..base + end * inner]);
        }
        Ok(Tensor { data, shape })
    }

    // ─── Element-wise Unary Operations ──────────────────────────────────────

    pub fn apply<F: Fn(T) -> T>(&self, f: F) -> Tensor<T> {
        Tensor {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    pub fn apply_mut<F: Fn(T) -> T>(&mut self, f: F) {
        for x in self.data.iter_mut() {
            *x = f(*x);
        }
    }

    /// ReLU activation: max(0, x).
    pub fn relu(&self) -> Tensor<T> {
        self.apply(|x| x.max(T::ZERO))
    }

    pub fn add_scalar(&self, s: T) -> Tensor<T> { self.apply(|x| x + s) }
    pub fn mul_scalar(&self, s: T) -> Tensor<T> { self.apply(|x| x * s) }

    // ─── Element-wise Binary Operations ─────────────────────────────────────

    /// Combine two tensors of identical shape element by element.
    pub fn zip_with<F: Fn(T, T) -> T>(&self, other: &Tensor<T>, op: F) -> TensorResult<Tensor<T>> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape_vec(),
                got: other.shape_vec(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| op(a, b))
            .collect();
        Ok(Tensor {
            data,
            shape: self.shape.clone(),
        })
    }

    pub fn add(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        self.zip_with(other, |a, b| a * b)
    }

    /// In-place `self += other`; shapes must match.
    pub fn add_assign(&mut self, other: &Tensor<T>) -> TensorResult<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape_vec(),
                got: other.shape_vec(),
            });
        }
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    // ─── Reduction Operations ───────────────────────────────────────────────

    /// Sum of all elements.
    pub fn sum_all(&self) -> T {
        self.data.iter().copied().sum()
    }

    pub fn max_all(&self) -> TensorResult<T> {
        self.data
            .iter()
            .copied()
            .reduce(|a, b| a.max(b))
            .ok_or_else(|| TensorError::InvalidOperation("max of an empty tensor".to_string()))
    }

    pub fn min_all(&self) -> TensorResult<T> {
        self.data
            .iter()
            .copied()
            .reduce(|a, b| a.min(b))
            .ok_or_else(|| TensorError::InvalidOperation("min of an empty tensor".to_string()))
    }

    /// Per-channel sums of an NHWC tensor (reduces batch, height and width).
    pub fn sum_channels(&self) -> TensorResult<Vec<T>> {
        let (_, _, _, c) = self.shape.nhwc()?;
        let mut sums = vec![T::ZERO; c];
        for pixel in self.data.chunks_exact(c.max(1)) {
            for (s, &v) in sums.iter_mut().zip(pixel) {
                *s += v;
            }
        }
        Ok(sums)
    }
}

impl<T: Float> PartialEq for Tensor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}

impl<T: Float> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 8;
        write!(f, "Tensor(shape={}, data=[", self.shape)?;
        for (i, v) in self.data.iter().take(PREVIEW).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:.4}", v)?;
        }
        if self.data.len() > PREVIEW {
            write!(f, ", ...")?;
        }
        write!(f, "])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: Vec<usize>) -> Tensor<f64> {
        let n: usize = shape.iter().product();
        Tensor::new((0..n).map(|i| i as f64).collect(), shape).unwrap()
    }

    #[test]
    fn test_creation() {
        let t: Tensor<f64> = Tensor::zeros(vec![3, 4]);
        assert_eq!(t.shape_vec(), vec![3, 4]);
        assert_eq!(t.numel(), 12);
        assert_eq!(t.data()[0], 0.0);

        let t: Tensor<f64> = Tensor::ones(vec![2, 3]);
        assert_eq!(t.sum_all(), 6.0);

        assert!(Tensor::<f64>::new(vec![1.0, 2.0], vec![3]).is_err());
    }

    #[test]
    fn test_get_set() {
        let mut t = iota(vec![2, 2, 2, 3]);
        assert_eq!(t.get(&[1, 0, 1, 2]).unwrap(), 17.0);
        t.set(&[0, 0, 0, 0], -1.0).unwrap();
        assert_eq!(t.data()[0], -1.0);
        assert!(t.get(&[2, 0, 0, 0]).is_err());
        assert!(t.get(&[0, 0]).is_err());
    }

    #[test]
    fn test_pad_last_axis() {
        let t = iota(vec![1, 2, 1, 2]);
        let p = t.pad_axis(3, 2, 0.0).unwrap();
        assert_eq!(p.shape_vec(), vec![1, 2, 1, 4]);
        assert_eq!(p.data(), &[0.0, 1.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_pad_inner_axis() {
        let t = iota(vec![2, 2]);
        let p = t.pad_axis(0, 1, 9.0).unwrap();
        assert_eq!(p.shape_vec(), vec![3, 2]);
        assert_eq!(p.data(), &[0.0, 1.0, 2.0, 3.0, 9.0, 9.0]);

        let q = t.pad_axis(1, 0, 9.0).unwrap();
        assert_eq!(q, t);
    }

    #[test]
    fn test_slice_axis_undoes_pad() {
        let t = iota(vec![2, 3, 3, 2]);
        let p = t.pad_axis(3, 3, 0.0).unwrap();
        let s = p.slice_axis(3, 0, 2).unwrap();
        assert_eq!(s, t);

        let tail = p.slice_axis(3, 2, 5).unwrap();
        assert!(tail.data().iter().all(|&v| v == 0.0));
        assert!(p.slice_axis(3, 4, 6).is_err());
    }

    #[test]
    fn test_arithmetic() {
        let a: Tensor<f64> = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let b: Tensor<f64> = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]).unwrap();
        assert_eq!(a.add(&b).unwrap().data(), &[6.0, 8.0, 10.0, 12.0]);
        assert_eq!(b.sub(&a).unwrap().data(), &[4.0, 4.0, 4.0, 4.0]);
        assert_eq!(a.mul(&b).unwrap().data(), &[5.0, 12.0, 21.0, 32.0]);

        let c: Tensor<f64> = Tensor::zeros(vec![4]);
        assert!(matches!(a.add(&c), Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_add_assign() {
        let mut a: Tensor<f64> = Tensor::ones(vec![3]);
        a.add_assign(&Tensor::full(vec![3], 2.0)).unwrap();
        assert_eq!(a.data(), &[3.0, 3.0, 3.0]);
        assert!(a.add_assign(&Tensor::ones(vec![2])).is_err());
    }

    #[test]
    fn test_relu() {
        let a: Tensor<f64> = Tensor::new(vec![-1.5, 0.0, 2.5], vec![3]).unwrap();
        assert_eq!(a.relu().data(), &[0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_sum_channels() {
        let t = iota(vec![1, 2, 1, 3]);
        assert_eq!(t.sum_channels().unwrap(), vec![3.0, 5.0, 7.0]);
        assert!(iota(vec![2, 3]).sum_channels().is_err());
    }

    #[test]
    fn test_uniform_bounds() {
        let t: Tensor<f64> = Tensor::uniform(vec![500], -0.5, 0.5, Some(7));
        assert!(t.min_all().unwrap() >= -0.5);
        assert!(t.max_all().unwrap() < 0.5);
        assert_eq!(t, Tensor::uniform(vec![500], -0.5, 0.5, Some(7)));
    }

    #[test]
    fn test_randn_moments() {
        let t: Tensor<f64> = Tensor::randn(vec![4001], Some(3));
        assert_eq!(t.numel(), 4001);
        let mean = t.sum_all() / 4001.0;
        approx::assert_abs_diff_eq!(mean, 0.0, epsilon = 0.1);
    }
}
