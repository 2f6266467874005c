use resblock_core::shape::CHANNEL_AXIS;
use resblock_core::Tensor;
use tracing::{debug, trace};

use crate::config::ResidualBlockConfig;
use crate::conv::Conv2D;
use crate::error::{BlockError, NnResult};
use crate::layers::{nhwc, Layer, Mode, Param, ReLU};
use crate::merge::{merge, split_gradient};
use crate::norm::BatchNorm2D;
use crate::state::{BlockState, NamedTensor};

/// Convolution → batch normalization → optional ReLU.
#[derive(Debug, Clone)]
pub struct ConvStage {
    pub conv: Conv2D,
    pub norm: BatchNorm2D,
    activation: Option<ReLU>,
}

impl ConvStage {
    fn new(config: &ResidualBlockConfig, seed: u64, activated: bool) -> NnResult<Self> {
        Ok(ConvStage {
            conv: Conv2D::new(config.filters, config.kernel_size, config.use_bias, seed)?,
            norm: BatchNorm2D::new(config.momentum, config.epsilon)?,
            activation: activated.then(ReLU::new),
        })
    }

    fn build(&mut self, in_channels: usize) -> NnResult<()> {
        self.conv.build(in_channels)?;
        self.norm.build(self.conv.filters)
    }

    fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        for p in self.conv.parameters() {
            out.push(NamedTensor::new(format!("{}.conv.{}", prefix, p.name()), &p.value));
        }
        for p in self.norm.parameters() {
            out.push(NamedTensor::new(format!("{}.norm.{}", prefix, p.name()), &p.value));
        }
        if let (Some(mean), Some(var)) = (self.norm.moving_mean(), self.norm.moving_variance()) {
            out.push(NamedTensor::new(format!("{}.norm.moving_mean", prefix), mean));
            out.push(NamedTensor::new(format!("{}.norm.moving_variance", prefix), var));
        }
    }

    /// Overwrite every tensor of a built stage; returns how many were read.
    fn import(&mut self, prefix: &str, state: &BlockState) -> NnResult<usize> {
        let mut read = 0;
        for p in self.conv.parameters_mut() {
            let name = format!("{}.conv.{}", prefix, p.name());
            p.assign(state.tensor(&name)?)?;
            read += 1;
        }
        for p in self.norm.parameters_mut() {
            let name = format!("{}.norm.{}", prefix, p.name());
            p.assign(state.tensor(&name)?)?;
            read += 1;
        }
        let mean = state.tensor(&format!("{}.norm.moving_mean", prefix))?;
        let var = state.tensor(&format!("{}.norm.moving_variance", prefix))?;
        self.norm.set_running_statistics(mean, var)?;
        Ok(read + 2)
    }
}

impl Layer for ConvStage {
    fn forward(&mut self, input: &Tensor<f64>, mode: Mode) -> NnResult<Tensor<f64>> {
        let x = self.conv.forward(input, mode)?;
        let x = self.norm.forward(&x, mode)?;
        match self.activation.as_mut() {
            Some(relu) => relu.forward(&x, mode),
            None => Ok(x),
        }
    }

    fn backward(&mut self, grad_output: &Tensor<f64>) -> NnResult<Tensor<f64>> {
        let g = match self.activation.as_mut() {
            Some(relu) => relu.backward(grad_output)?,
            None => grad_output.clone(),
        };
        let g = self.norm.backward(&g)?;
        self.conv.backward(&g)
    }

    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.conv.parameters();
        params.extend(self.norm.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.conv.parameters_mut();
        params.extend(self.norm.parameters_mut());
        params
    }
}

/// Residual convolutional block.
///
/// ```text
/// y1  = relu(norm1(conv1(x)))
/// y2  = norm2(conv2(y1))
/// out = relu(pad(x) + pad(y2))
/// ```
///
/// Whichever of `x` and `y2` has fewer channels is padded with trailing zero
/// channels, so the output has `max(C_in, filters)` channels and the input's
/// batch, height and width. Parameters are built from the channel count of the
/// first input (or by [`ResidualBlock::build`]) and stay fixed afterwards.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    config: ResidualBlockConfig,
    stage1: ConvStage,
    stage2: ConvStage,
    activation: ReLU,
    merged_channels: Option<(usize, usize)>,
}

impl ResidualBlock {
    pub fn new(config: ResidualBlockConfig) -> NnResult<Self> {
        config.validate()?;
        let stage1 = ConvStage::new(&config, config.seed, true)?;
        let stage2 = ConvStage::new(&config, config.second_stage_seed(), false)?;
        Ok(ResidualBlock {
            config,
            stage1,
            stage2,
            activation: ReLU::new(),
            merged_channels: None,
        })
    }

    pub fn config(&self) -> &ResidualBlockConfig {
        &self.config
    }

    pub fn stage1(&self) -> &ConvStage {
        &self.stage1
    }

    pub fn stage2(&self) -> &ConvStage {
        &self.stage2
    }

    /// Input channel count the parameters were built for.
    pub fn input_channels(&self) -> Option<usize> {
        self.stage1.conv.in_channels()
    }

    pub fn is_built(&self) -> bool {
        self.input_channels().is_some()
    }

    /// Channel count of the output for an input with `in_channels` channels.
    pub fn output_channels(&self, in_channels: usize) -> usize {
        in_channels.max(self.config.filters)
    }

    /// Create all parameters for inputs with `in_channels` channels.
    pub fn build(&mut self, in_channels: usize) -> NnResult<()> {
        if self.input_channels() == Some(in_channels) {
            return Ok(());
        }
        self.stage1.build(in_channels)?;
        self.stage2.build(self.config.filters)?;
        debug!(
            in_channels,
            filters = self.config.filters,
            kernel_size = ?self.config.kernel_size,
            "built residual block"
        );
        Ok(())
    }

    /// The transformed path `norm2(conv2(relu(norm1(conv1(x)))))` before the merge.
    pub fn transform(&mut self, input: &Tensor<f64>, mode: Mode) -> NnResult<Tensor<f64>> {
        let (_, _, _, c_in) = nhwc(input)?;
        self.build(c_in)?;
        let y1 = self.stage1.forward(input, mode)?;
        self.stage2.forward(&y1, mode)
    }

    /// Snapshot of the configuration and every learned tensor.
    pub fn state(&self) -> BlockState {
        let mut tensors = Vec::new();
        self.stage1.export("stage1", &mut tensors);
        self.stage2.export("stage2", &mut tensors);
        BlockState {
            config: self.config.clone(),
            input_channels: self.input_channels(),
            tensors,
        }
    }

    /// Rebuild a block from a snapshot taken with [`ResidualBlock::state`].
    pub fn from_state(state: &BlockState) -> NnResult<Self> {
        let mut block = ResidualBlock::new(state.config.clone())?;
        block.load_state(state)?;
        Ok(block)
    }

    /// Overwrite this block's tensors. The block is left untouched on error.
    pub fn load_state(&mut self, state: &BlockState) -> NnResult<()> {
        if state.config != self.config {
            return Err(BlockError::StateMismatch(format!(
                "state was saved with {:?}, block uses {:?}",
                state.config, self.config
            )));
        }
        let Some(in_channels) = state.input_channels else {
            if !state.tensors.is_empty() {
                return Err(BlockError::StateMismatch(
                    "state has tensors but no input channel count".to_string(),
                ));
            }
            if self.is_built() {
                debug!("loading an unbuilt state, dropping built parameters");
                *self = ResidualBlock::new(self.config.clone())?;
            }
            return Ok(());
        };

        let mut staged = self.clone();
        staged.build(in_channels)?;
        let read = staged.stage1.import("stage1", state)? + staged.stage2.import("stage2", state)?;
        if read != state.tensors.len() {
            return Err(BlockError::StateMismatch(format!(
                "state holds {} tensors, block uses {}",
                state.tensors.len(),
                read
            )));
        }
        *self = staged;
        Ok(())
    }
}

impl Layer for ResidualBlock {
    fn forward(&mut self, input: &Tensor<f64>, mode: Mode) -> NnResult<Tensor<f64>> {
        let (_, _, _, c_in) = nhwc(input)?;
        trace!(?mode, shape = %input.shape(), "residual block forward");
        let transformed = self.transform(input, mode)?;
        let c_out = transformed.shape().dim(CHANNEL_AXIS)?;
        let sum = merge(input, &transformed)?;
        self.merged_channels = Some((c_in, c_out));
        self.activation.forward(&sum, mode)
    }

    fn backward(&mut self, grad_output: &Tensor<f64>) -> NnResult<Tensor<f64>> {
        let (c_in, c_out) = self
            .merged_channels
            .ok_or(BlockError::NoForwardCache("ResidualBlock"))?;
        let grad_sum = self.activation.backward(grad_output)?;
        let (grad_shortcut, grad_transformed) = split_gradient(&grad_sum, c_in, c_out)?;
        let grad_y1 = self.stage2.backward(&grad_transformed)?;
        let grad_x = self.stage1.backward(&grad_y1)?;
        Ok(grad_x.add(&grad_shortcut)?)
    }

    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.stage1.parameters();
        params.extend(self.stage2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.stage1.parameters_mut();
        params.extend(self.stage2.parameters_mut());
        params
    }
}
