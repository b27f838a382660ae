//! Error types for backend operations

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur inside a device backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Device ordinal outside the backend's device count
    #[error("invalid device ordinal: {0}")]
    InvalidDevice(usize),

    /// Device pointer does not name a live allocation
    #[error("invalid device pointer: {0:#x}")]
    InvalidDevicePointer(u64),

    /// Allocation request could not be satisfied
    #[error("allocation failed: requested {requested} bytes")]
    AllocationFailed { requested: usize },

    /// Transfer would run past the end of the target allocation
    #[error("transfer out of bounds: offset {offset} + len {len} > allocation size {size}")]
    TransferOutOfBounds { offset: usize, len: usize, size: usize },

    /// Image does not carry the expected contract version
    #[error("image version mismatch: expected {expected}, got {actual}")]
    ImageVersionMismatch { expected: u32, actual: u32 },

    /// Image was never loaded on this device
    #[error("image not loaded on device {device}")]
    ImageNotLoaded { device: usize },

    /// Kernel entry address does not name a loaded function
    #[error("invalid kernel entry address: {0:#x}")]
    InvalidEntry(u64),

    /// Operation not supported by this backend
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Generic backend failure
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}
