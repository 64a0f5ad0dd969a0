use thiserror::Error;

pub type LayerResult<T> = Result<T, LayerError>;

/// Errors raised by the tensor primitives, the layers and the network.
///
/// Shape and state errors are programmer errors: they abort the current
/// training step. Numerical anomalies (NaN/Inf after a division) are not
/// represented here, they are zeroed in place and logged.
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Channel mismatch: expected {expected} channels, got {found}.")]
    ChannelMismatch { expected: usize, found: usize },
    #[error("Shape error: {0}")]
    ShapeError(String),
    #[error("Array could not be reshaped:\n {0}.")]
    Reshape(#[from] ndarray::ShapeError),
    #[error("State error: {0}")]
    StateError(String),
    #[error("Invalid layer parameter: {0}")]
    InvalidParameter(String),
    #[error("Network has no layers. Construct it from encoder layers or load a model first.")]
    EmptyNetwork,
}
