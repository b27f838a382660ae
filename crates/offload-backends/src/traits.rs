//! Backend trait: the functional contract every device backend implements
//!
//! The engine talks to hardware exclusively through this trait. A backend
//! exposes one or more devices (ordinals `0..device_count()`), each with its
//! own address space, and implements memory management, transfers, image
//! loading, and kernel launch for them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Mapping Engine                        │
//! │        (index, batches, refcounts, image loader)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Backend trait
//!         ┌─────────────┼─────────────┬─────────────┐
//!         ▼             ▼             ▼             ▼
//!   ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐
//!   │   CPU   │  │  CUDA   │  │  Metal  │  │   ...   │
//!   │  (emu)  │  │         │  │         │  │         │
//!   └─────────┘  └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! # Contract rules
//!
//! - `capabilities()` is inspected exactly once, at registration. A backend
//!   whose required capability subset is incomplete, or whose contract
//!   version mismatches, fails discovery for that backend only.
//! - All calls are synchronous from the engine's viewpoint. A backend may
//!   queue asynchronous device work internally; the engine's async refcounts
//!   keep mappings alive until that work is separately acknowledged.
//! - Host addresses are raw: the caller guarantees they reference live host
//!   memory valid for the described access.

use crate::error::Result;
use crate::types::{BackendKind, Capabilities, DevicePtr, ImageBlob, LoadedSymbol};

/// Functional contract of a device backend
pub trait Backend: Send + Sync {
    /// Backend family (used to match offload images to devices)
    fn kind(&self) -> BackendKind;

    /// Capability set, inspected once at registration
    fn capabilities(&self) -> Capabilities;

    /// Number of devices this backend exposes
    fn device_count(&self) -> usize;

    /// One-time device initialization
    ///
    /// Called under the owning device's lock before any other per-device
    /// operation.
    fn init(&self, device: usize) -> Result<()>;

    /// Tear down a device at process exit
    fn fini(&self, device: usize) -> Result<()>;

    /// Allocate `bytes` of device memory
    ///
    /// The returned pointer is suitably aligned for any mapped variable.
    fn alloc(&self, device: usize, bytes: usize) -> Result<DevicePtr>;

    /// Free a previously allocated device pointer
    fn free(&self, device: usize, ptr: DevicePtr) -> Result<()>;

    /// Copy `len` bytes from host memory at `src` to device memory at `dst`
    ///
    /// `src` must reference live host memory readable for `len` bytes.
    fn host_to_device(&self, device: usize, dst: DevicePtr, src: u64, len: usize) -> Result<()>;

    /// Copy `len` bytes from device memory at `src` to host memory at `dst`
    ///
    /// `dst` must reference live host memory writable for `len` bytes.
    fn device_to_host(&self, device: usize, dst: u64, src: DevicePtr, len: usize) -> Result<()>;

    /// Copy `len` bytes between two device pointers on the same device
    ///
    /// Optional: backends without the `device_to_device` capability return
    /// an unsupported-operation error.
    fn device_to_device(&self, device: usize, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<()>;

    /// Load an offload image, returning one entry per image symbol
    ///
    /// The returned entries are validated by the engine: every symbol must
    /// be accounted for, and variable sizes must match the host-declared
    /// sizes.
    fn load_image(&self, device: usize, image: &ImageBlob) -> Result<Vec<LoadedSymbol>>;

    /// Unload a previously loaded image, releasing its device storage
    fn unload_image(&self, device: usize, image: &ImageBlob) -> Result<()>;

    /// Launch the kernel at `entry` with the device-resident argument block
    /// at `args`
    ///
    /// `entry` must be a device function address returned by `load_image`;
    /// `args` points at a device-resident array of argument addresses.
    fn run(&self, device: usize, entry: DevicePtr, args: DevicePtr) -> Result<()>;
}
