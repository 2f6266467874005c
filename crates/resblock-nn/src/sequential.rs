use resblock_core::Tensor;

use crate::error::NnResult;
use crate::layers::{Layer, Mode, Param};

/// Sequential model: chains layers in order.
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new() -> Self {
        Sequential { layers: Vec::new() }
    }

    /// Add a layer to the model.
    pub fn add(mut self, layer: Box<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for Sequential {
    /// Forward pass through all layers.
    fn forward(&mut self, input: &Tensor<f64>, mode: Mode) -> NnResult<Tensor<f64>> {
        let mut x = input.clone();
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x, mode)?;
        }
        Ok(x)
    }

    /// Backward pass through all layers, last to first.
    fn backward(&mut self, grad_output: &Tensor<f64>) -> NnResult<Tensor<f64>> {
        let mut g = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            g = layer.backward(&g)?;
        }
        Ok(g)
    }

    /// Collect all trainable parameters from all layers.
    fn parameters(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.parameters_mut()).collect()
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}
