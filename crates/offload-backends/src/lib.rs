//! Device backend contract for the offload engine
//!
//! This crate provides:
//! - **Backend Trait**: the versioned functional contract every device
//!   backend implements (alloc/free, transfers, image load/unload, run)
//! - **Capability Set**: the required-vs-optional feature check performed
//!   once at backend registration
//! - **CPU Backend**: host-emulation reference implementation whose device
//!   memory is host heap storage
//!
//! Vendor backends (CUDA, Metal, ...) implement the same trait in their own
//! crates; the engine in `offload-core` never depends on anything beyond
//! this contract.

pub mod cpu;
pub mod error;
pub mod traits;
pub mod types;

// Re-export public API
pub use cpu::{CpuBackend, HostKernel};
pub use error::{BackendError, Result};
pub use traits::Backend;
pub use types::{
    BackendKind, Capabilities, DevicePtr, ImageBlob, ImageSymbol, LoadedSymbol, SymbolKind, CONTRACT_VERSION,
};
