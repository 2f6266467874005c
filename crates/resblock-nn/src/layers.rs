use resblock_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{BlockError, NnResult};

/// Whether normalization layers use batch statistics (and update their
/// running averages) or the frozen running statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// A trainable tensor together with its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Param {
    name: &'static str,
    pub value: Tensor<f64>,
    pub grad: Tensor<f64>,
}

impl Param {
    pub fn new(name: &'static str, value: Tensor<f64>) -> Self {
        let grad = Tensor::zeros_like(&value);
        Param { name, value, grad }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shape_vec(&self) -> Vec<usize> {
        self.value.shape_vec()
    }

    pub fn zero_grad(&mut self) {
        self.grad.apply_mut(|_| 0.0);
    }

    /// Replace the value, keeping the shape fixed at build time.
    pub fn assign(&mut self, value: Tensor<f64>) -> NnResult<()> {
        if value.shape() != self.value.shape() {
            return Err(BlockError::StateMismatch(format!(
                "{}: expected shape {}, got {}",
                self.name,
                self.value.shape(),
                value.shape()
            )));
        }
        self.value = value;
        Ok(())
    }
}

/// Trait for a neural network layer operating on NHWC feature maps.
///
/// `backward` consumes the activations cached by the most recent `forward`
/// and adds parameter gradients into each [`Param::grad`].
pub trait Layer {
    /// Forward pass.
    fn forward(&mut self, input: &Tensor<f64>, mode: Mode) -> NnResult<Tensor<f64>>;
    /// Backward pass: gradient w.r.t. the input of the last forward call.
    fn backward(&mut self, grad_output: &Tensor<f64>) -> NnResult<Tensor<f64>>;
    /// Return all trainable parameters.
    fn parameters(&self) -> Vec<&Param>;
    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }
}

/// Unpack an NHWC input, rejecting anything that is not rank 4.
pub(crate) fn nhwc(input: &Tensor<f64>) -> NnResult<(usize, usize, usize, usize)> {
    input.shape().nhwc().map_err(|_| BlockError::InvalidInput {
        expected_rank: 4,
        got: input.shape_vec(),
    })
}

/// ReLU activation layer.
#[derive(Debug, Clone, Default)]
pub struct ReLU {
    output: Option<Tensor<f64>>,
}

impl ReLU {
    pub fn new() -> Self {
        ReLU { output: None }
    }
}

impl Layer for ReLU {
    fn forward(&mut self, input: &Tensor<f64>, _mode: Mode) -> NnResult<Tensor<f64>> {
        let out = input.relu();
        self.output = Some(out.clone());
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor<f64>) -> NnResult<Tensor<f64>> {
        let out = self.output.as_ref().ok_or(BlockError::NoForwardCache("ReLU"))?;
        Ok(grad_output.zip_with(out, |g, y| if y > 0.0 { g } else { 0.0 })?)
    }

    fn parameters(&self) -> Vec<&Param> { vec![] }
    fn parameters_mut(&mut self) -> Vec<&mut Param> { vec![] }
}
