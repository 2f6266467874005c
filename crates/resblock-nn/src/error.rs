use resblock_core::TensorError;
use thiserror::Error;

/// Errors raised by layers and by the residual block.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Shape mismatch at residual merge: shortcut {shortcut:?}, transformed {transformed:?}")]
    ShapeMismatch {
        shortcut: Vec<usize>,
        transformed: Vec<usize>,
    },

    #[error("Invalid input: expected a rank-{expected_rank} tensor, got shape {got:?}")]
    InvalidInput { expected_rank: usize, got: Vec<usize> },

    #[error("Input channel mismatch: layer was built for {expected} channels, got {got}")]
    InputChannels { expected: usize, got: usize },

    #[error("backward called on {0} before a forward pass")]
    NoForwardCache(&'static str),

    #[error("{0} parameters have not been built")]
    NotBuilt(&'static str),

    #[error("State mismatch: {0}")]
    StateMismatch(String),

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type NnResult<T> = Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_parameters_and_missing_cache_read_differently() {
        let not_built = BlockError::NotBuilt("Conv2D").to_string();
        assert_eq!(not_built, "Conv2D parameters have not been built");
        assert!(!not_built.contains("backward"));
        assert!(BlockError::NoForwardCache("Conv2D").to_string().contains("before a forward pass"));
    }
}
