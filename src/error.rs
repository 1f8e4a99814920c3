use thiserror::Error;

/// Errors produced by records, replay buffers, environments and policies
#[derive(Error, Debug)]
pub enum Error {
    /// Field or batch shapes are incompatible
    #[error("shape error: {0}")]
    Shape(String),

    /// A replay buffer was configured with an unusable capacity
    #[error("capacity must be positive, got {0}")]
    Capacity(usize),

    /// A required field is absent from a record
    #[error("missing key `{0}`")]
    MissingKey(String),

    /// A row or slot index lies outside the valid range
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// Sampling was requested from a buffer holding no rows
    #[error("cannot sample from an empty buffer")]
    EmptyBuffer,

    /// Sampling was requested with an unusable batch size
    #[error("invalid sample size {0}")]
    InvalidBatchSize(usize),

    /// A hyperparameter is out of its valid range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A priority signal is NaN or infinite
    #[error("priority must be finite, got {0}")]
    InvalidPriority(f32),

    /// Every action of a row is masked out
    #[error("no available action in row {0}")]
    NoAvailableAction(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::Shape(err.to_string())
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
