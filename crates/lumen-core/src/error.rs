//! Error types for lumen-core operations

use lumen_backends::BackendError;

/// Result type for lumen-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad descriptor, layout, type or tile, detected before execution
    InvalidArgument,
    /// The scheduler cannot meet the memory budget
    ConfigurationError,
    /// An allocation failed
    OutOfMemory,
    /// An asynchronous command aborted; the engine must be recreated
    DeviceError,
    /// Operation invoked before its required inputs were bound
    LogicError,
}

/// Errors that can occur in lumen-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("device error: {0}")]
    Device(String),

    #[error("logic error: {0}")]
    Logic(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Configuration(_) => ErrorKind::ConfigurationError,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::Device(_) => ErrorKind::DeviceError,
            Error::Logic(_) => ErrorKind::LogicError,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::OutOfMemory { requested, available } => Error::OutOfMemory { requested, available },
            err if err.is_invalid_argument() => Error::InvalidArgument(err.to_string()),
            err => Error::Device(err.to_string()),
        }
    }
}
