use resblock_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::ResidualBlockConfig;
use crate::error::{BlockError, NnResult};

/// One serialized tensor: (name, shape, row-major data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NamedTensor {
    pub fn new(name: String, tensor: &Tensor<f64>) -> Self {
        NamedTensor {
            name,
            shape: tensor.shape_vec(),
            data: tensor.data().to_vec(),
        }
    }
}

/// Snapshot of a residual block: configuration plus all learned tensors,
/// including the normalization running statistics.
///
/// Tensor names are `stage{1,2}.conv.{kernel,bias}` and
/// `stage{1,2}.norm.{gamma,beta,moving_mean,moving_variance}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockState {
    pub config: ResidualBlockConfig,
    pub input_channels: Option<usize>,
    pub tensors: Vec<NamedTensor>,
}

impl BlockState {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|t| t.name.as_str())
    }

    pub fn tensor(&self, name: &str) -> NnResult<Tensor<f64>> {
        let entry = self
            .tensors
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| BlockError::StateMismatch(format!("missing tensor {}", name)))?;
        Ok(Tensor::new(entry.data.clone(), entry.shape.clone())?)
    }

    pub fn to_json(&self) -> NnResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> NnResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
