//! Residual convolutional block over NHWC feature maps, with the layer
//! primitives it is built from.

pub mod config;
pub mod conv;
pub mod error;
pub mod layers;
pub mod merge;
pub mod norm;
pub mod residual;
pub mod sequential;
pub mod state;

pub use config::ResidualBlockConfig;
pub use conv::Conv2D;
pub use error::{BlockError, NnResult};
pub use layers::{Layer, Mode, Param, ReLU};
pub use merge::{align, merge, pad_channels, reconcile};
pub use norm::BatchNorm2D;
pub use residual::{ConvStage, ResidualBlock};
pub use sequential::Sequential;
pub use state::{BlockState, NamedTensor};
