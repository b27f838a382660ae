//! Offload image loading: permanent records for kernels and globals
//!
//! Registering an image hands its blob to every initialized device of the
//! matching backend kind; devices initialized later replay all registered
//! images before their first operation. Each reported symbol becomes a
//! permanent mapping record: functions key a zero-length range at their host
//! function address (the launch path resolves kernels through the same
//! index as data), variables key their host address range.
//!
//! The backend's report is validated strictly. A missing or surplus entry,
//! or a variable whose device size disagrees with its host declaration,
//! means host and device were compiled from different sources; both are
//! fatal.

use std::fmt;

use offload_backends::{BackendKind, ImageBlob, SymbolKind};

use crate::batch::MappingRecord;
use crate::device::{Device, DeviceState};
use crate::error::{Error, Result};
use crate::index::HostRange;
use crate::refcount::RefCount;

/// Handle to a registered offload image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHandle(pub u64);

impl fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "img{}", self.0)
    }
}

/// A compiled offload unit plus the backend kind it targets
#[derive(Debug)]
pub struct OffloadImage {
    /// Backend family the payload was compiled for
    pub kind: BackendKind,
    /// Symbol table and device code
    pub blob: ImageBlob,
}

impl OffloadImage {
    /// Wrap a blob for one backend kind
    pub fn new(kind: BackendKind, blob: ImageBlob) -> Self {
        Self { kind, blob }
    }
}

fn symbol_range(symbol: &offload_backends::ImageSymbol) -> HostRange {
    match symbol.kind {
        SymbolKind::Function => HostRange::new(symbol.host_addr, symbol.host_addr),
        SymbolKind::Variable => HostRange::with_len(symbol.host_addr, symbol.size),
    }
}

/// Load an image into one device, creating permanent records for every
/// exported symbol. Called with the device lock held.
pub(crate) fn load_into(device: &Device, state: &mut DeviceState, image: &OffloadImage) -> Result<()> {
    let entries = device.backend().load_image(device.ordinal(), &image.blob)?;
    if entries.len() != image.blob.symbols.len() {
        return Err(Error::ImageCountMismatch {
            expected: image.blob.symbols.len(),
            reported: entries.len(),
        });
    }

    for entry in &entries {
        let symbol = image
            .blob
            .symbols
            .get(entry.host_index)
            .ok_or(Error::InternalKind("image symbol index"))?;
        if symbol.kind == SymbolKind::Variable && entry.device_size != symbol.size {
            return Err(Error::ImageSizeMismatch {
                name: symbol.name.clone(),
                host: symbol.size,
                device: entry.device_size,
            });
        }

        let range = symbol_range(symbol);
        let id = state.new_record_id();
        state.records.insert(
            id,
            MappingRecord {
                host: range,
                device_base: entry.device_ptr,
                owner: None,
                sync_refs: RefCount::Permanent,
                async_refs: 0,
                from_associate: false,
            },
        );
        if state.index.insert(range, id).is_some() {
            return Err(Error::InternalKind("image symbol collision"));
        }
        tracing::debug!(
            device = device.id(),
            symbol = %symbol.name,
            host = %range,
            dev = %entry.device_ptr,
            "image symbol loaded"
        );
    }
    Ok(())
}

/// Unload an image from one device, dropping its permanent records. Called
/// with the device lock held.
pub(crate) fn unload_from(device: &Device, state: &mut DeviceState, image: &OffloadImage) -> Result<()> {
    device.backend().unload_image(device.ordinal(), &image.blob)?;
    for symbol in &image.blob.symbols {
        let range = symbol_range(symbol);
        if let Some(id) = state.index.remove(&range) {
            state.records.remove(&id);
        }
    }
    tracing::debug!(device = device.id(), symbols = image.blob.symbols.len(), "image unloaded");
    Ok(())
}
