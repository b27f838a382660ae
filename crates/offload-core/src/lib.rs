//! Host-to-accelerator memory mapping and offload execution engine
//!
//! This crate tracks which host memory is mirrored on which device and moves
//! data and control across that boundary. Each device carries an ordered
//! interval index from host address ranges to mapping records; batches of
//! map items resolve against that index (reusing live records, allocating
//! one contiguous buffer for everything new), kernels launch against
//! device-resident argument blocks, and refcount-driven release tears the
//! mappings back down.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Registry                          │
//! │        (discovery, device resolution, image replay)      │
//! └───────┬──────────────────────────────────────────────────┘
//!         │ per device, under one lock
//! ┌───────▼──────────────────────────────────────────────────┐
//! │  Device: RangeIndex ── MappingRecords ── Batches         │
//! │     mapping (resolve + commit)    release (refcounted)   │
//! └───────┬──────────────────────────────────────────────────┘
//!         │ Backend trait
//! ┌───────▼──────────────────────────────────────────────────┐
//! │        offload-backends (CPU emulation, CUDA, ...)       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use offload_core::{BatchRequest, MapItem, PragmaKind, Registry};
//!
//! let registry = Registry::global();
//! if let Some(device) = registry.resolve(0) {
//!     let data = vec![1.0f32; 16];
//!     let items = vec![MapItem::to(data.as_ptr() as u64, 64)];
//!     let batch = device
//!         .map_batch(BatchRequest::new(PragmaKind::DataRegion, items))
//!         .unwrap()
//!         .unwrap();
//!     assert!(device.is_present(data.as_ptr() as u64, 64));
//!     device.release_batch(batch, true).unwrap();
//! }
//! ```

pub mod batch;
pub mod config;
pub mod copy;
pub mod device;
pub mod error;
pub mod image;
pub mod index;
pub mod mapping;
pub mod refcount;
pub mod registry;

mod release;

pub use batch::{Batch, BatchId, DeviceBuffer, ItemResult, MappingRecord, RecordId};
pub use config::{default_device, set_default_device};
pub use copy::{CopyEndpoint, RectCopy};
pub use device::Device;
pub use error::{Error, Result};
pub use image::{ImageHandle, OffloadImage};
pub use index::{HostRange, RangeIndex};
pub use mapping::{BatchRequest, ItemKind, MapItem, MapType, PragmaKind};
pub use refcount::RefCount;
pub use registry::{Registry, DEVICE_DEFAULT, DEVICE_HOST};

pub use offload_backends::{
    Backend, BackendError, BackendKind, Capabilities, CpuBackend, DevicePtr, ImageBlob,
    ImageSymbol, LoadedSymbol, SymbolKind, CONTRACT_VERSION,
};
pub use offload_tracing::{init_global_tracing, TracingConfig};
