//! Error types for the offload engine
//!
//! Errors come in two tiers. **Recoverable** errors surface as ordinary
//! `Err` values to the immediate caller: out-of-range device ids, ineligible
//! disassociations, cross-device copies, overflowing rectangle copies.
//! **Fatal** errors signal index corruption or a broken backend contract;
//! public entry points release the device lock, log them through
//! `tracing::error!`, and terminate via panic (an abort under the release
//! profile's `panic = "abort"`). [`Error::is_fatal`] is the tier predicate.

use offload_backends::BackendError;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the offload engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ---- recoverable -------------------------------------------------------

    /// Device id outside the registry (host fallback is not an error and is
    /// reported as "no device" by `resolve` instead)
    #[error("invalid device id: {0}")]
    InvalidDevice(i64),

    /// Batch handle does not name an open batch
    #[error("invalid batch handle: {0}")]
    InvalidBatch(u64),

    /// Association request overlaps an existing, incompatible record
    #[error("association conflicts with existing mapping at {host:#x}")]
    AssociateConflict { host: u64 },

    /// Record is not eligible for disassociation
    #[error("record at {host:#x} is not eligible for disassociation")]
    DisassociateNotEligible { host: u64 },

    /// No record exists at the given host address
    #[error("no record mapped at {host:#x}")]
    NoRecord { host: u64 },

    /// Offset or length arithmetic overflowed in a copy request
    #[error("copy offset/length arithmetic overflowed")]
    CopyOverflow,

    /// Copy between two distinct non-host devices
    #[error("copy between two distinct non-host devices is not supported")]
    CrossDeviceCopy,

    /// Rectangle copy shape arrays disagree on dimensionality
    #[error("rectangle copy shape mismatch: {0}")]
    RectShape(&'static str),

    /// Image handle does not name a registered image
    #[error("invalid image handle: {0}")]
    InvalidImage(u64),

    /// Backend operation failed
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    // ---- fatal --------------------------------------------------------------

    /// A forced or overlapping mapping collides with an incompatible record
    #[error("host range [{start:#x}, {end:#x}) is already mapped incompatibly")]
    IncompatibleMapping { start: u64, end: u64 },

    /// A forced-present range has no record
    #[error("host range [{start:#x}, {end:#x}) is not present on the device")]
    NotPresent { start: u64, end: u64 },

    /// A pointer rebase target is not mapped
    #[error("pointer rebase target {pointee:#x} is not mapped")]
    PointeeNotMapped { pointee: u64 },

    /// A struct member falls outside its enclosing record
    #[error("struct member [{start:#x}, {end:#x}) is not covered by its enclosing record")]
    PartialStructMapping { start: u64, end: u64 },

    /// Image symbol size disagrees between host declaration and device report
    #[error("image symbol '{name}' size mismatch: host {host} bytes, device {device} bytes")]
    ImageSizeMismatch { name: String, host: usize, device: usize },

    /// Backend reported a different entry count than the image declares
    #[error("image entry count mismatch: expected {expected}, backend reported {reported}")]
    ImageCountMismatch { expected: usize, reported: usize },

    /// Device allocator could not satisfy a new-buffer request
    #[error("device allocator exhausted: requested {requested} bytes")]
    AllocExhausted { requested: usize },

    /// An item kind reached a pass that cannot handle it
    #[error("internal: {0} cannot reach the commit pass")]
    InternalKind(&'static str),
}

impl Error {
    /// Whether this error belongs to the fatal tier
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IncompatibleMapping { .. }
                | Error::NotPresent { .. }
                | Error::PointeeNotMapped { .. }
                | Error::PartialStructMapping { .. }
                | Error::ImageSizeMismatch { .. }
                | Error::ImageCountMismatch { .. }
                | Error::AllocExhausted { .. }
                | Error::InternalKind(_)
        )
    }
}

/// Terminate the process on a fatal engine error.
///
/// Must only be called after every device lock has been released; parking_lot
/// guards drop on scope exit, so callers route through [`check_fatal`] from a
/// scope that no longer holds the guard.
pub(crate) fn die(err: Error) -> ! {
    debug_assert!(err.is_fatal());
    tracing::error!(error = %err, "fatal offload engine error");
    panic!("offload: {err}");
}

/// Pass recoverable errors through; terminate on fatal ones.
pub(crate) fn check_fatal<T>(result: Result<T>) -> Result<T> {
    match result {
        Err(err) if err.is_fatal() => die(err),
        other => other,
    }
}
