//! Error types for engine operations

use crate::backend::{BufferHandle, Storage};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors raised by engines, their allocators and command streams
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Handle does not name a live allocation of this engine
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(BufferHandle),

    /// Access outside an allocation
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// The engine cannot allocate this storage class
    #[error("{engine} engine does not support {storage:?} storage")]
    UnsupportedStorage { engine: String, storage: Storage },

    /// `free` called with a different storage class than `allocate`
    #[error("storage mismatch for {handle}: allocated as {allocated:?}, freed as {requested:?}")]
    StorageMismatch {
        handle: BufferHandle,
        allocated: Storage,
        requested: Storage,
    },

    /// Host access to memory that is not host-visible
    #[error("{handle} uses {storage:?} storage which is not host-visible")]
    NotHostVisible { handle: BufferHandle, storage: Storage },

    /// Allocation exceeds the engine capacity or the system allocator failed
    #[error("out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    /// An asynchronous command aborted
    #[error("device error: {0}")]
    DeviceError(String),

    /// The engine saw a failed command earlier and must be recreated
    #[error("engine invalidated by an earlier failure: {0}")]
    EngineInvalidated(String),

    /// Invalid argument to an engine call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Kernel-level failure reported by an operator
    #[error("execution error: {0}")]
    ExecutionError(String),
}

impl BackendError {
    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// True for failures of submitted work (as opposed to bad arguments)
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Self::DeviceError(_) | Self::EngineInvalidated(_))
    }

    /// True for argument or descriptor errors detected before any work ran
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidBufferHandle(_)
                | Self::BufferOutOfBounds { .. }
                | Self::UnsupportedStorage { .. }
                | Self::StorageMismatch { .. }
                | Self::NotHostVisible { .. }
                | Self::InvalidArgument(_)
        )
    }
}
