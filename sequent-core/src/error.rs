use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Layer '{layer}' was used before a forward pass")]
    NotForwarded { layer: String },

    #[error("Layer '{layer}' does not support {operation}")]
    Unsupported { layer: String, operation: String },

    #[error("Model is not compiled: bind a loss and an optimizer first")]
    NotCompiled,

    #[error("Weight count mismatch for '{name}': expected {expected} values, found {actual}")]
    WeightCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Training was cancelled")]
    Cancelled,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl NetError {
    pub fn shape(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        NetError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        NetError::InvalidArgument(message.into())
    }

    pub fn not_forwarded(layer: &str) -> Self {
        NetError::NotForwarded { layer: layer.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
