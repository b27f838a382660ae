//! Per-device engine state and the public device API
//!
//! A `Device` pairs one backend ordinal with the engine state that tracks
//! it: the address-range index, the record and batch slabs, and the open
//! data-region stack. All of that sits behind a single `parking_lot::Mutex`;
//! every engine operation takes the lock once, works to completion, and
//! releases it before reporting errors. Fatal errors terminate the process
//! from outside the lock scope so the guard is never poisoned mid-update.

use std::collections::HashMap;
use std::sync::Arc;

use offload_backends::{Backend, BackendError, BackendKind, DevicePtr};
use parking_lot::Mutex;

use crate::batch::{Batch, BatchId, DeviceBuffer, MappingRecord, RecordId};
use crate::error::{check_fatal, Error, Result};
use crate::index::{HostRange, RangeIndex};
use crate::mapping::{self, BatchRequest, MapItem};
use crate::refcount::RefCount;
use crate::release;

/// Mutable engine state of one device, guarded by the device lock
pub(crate) struct DeviceState {
    /// Whether the backend has been initialized for this ordinal
    pub initialized: bool,
    /// Ordered interval index over live host ranges
    pub index: RangeIndex,
    /// Record slab
    pub records: HashMap<RecordId, MappingRecord>,
    /// Open batch slab
    pub batches: HashMap<BatchId, Batch>,
    /// Innermost open data-region batch
    pub open_region: Option<BatchId>,
    next_record: u64,
    next_batch: u64,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            initialized: false,
            index: RangeIndex::new(),
            records: HashMap::new(),
            batches: HashMap::new(),
            open_region: None,
            next_record: 1,
            next_batch: 1,
        }
    }

    pub fn new_record_id(&mut self) -> RecordId {
        let id = RecordId(self.next_record);
        self.next_record += 1;
        id
    }

    pub fn new_batch_id(&mut self) -> BatchId {
        let id = BatchId(self.next_batch);
        self.next_batch += 1;
        id
    }
}

/// One registered device: a backend ordinal plus its engine state
pub struct Device {
    id: usize,
    ordinal: usize,
    backend: Arc<dyn Backend>,
    pub(crate) state: Mutex<DeviceState>,
}

impl Device {
    pub(crate) fn new(id: usize, ordinal: usize, backend: Arc<dyn Backend>) -> Self {
        Self {
            id,
            ordinal,
            backend,
            state: Mutex::new(DeviceState::new()),
        }
    }

    /// Registry-wide device id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Backend family this device belongs to
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Whether the backend has been initialized for this device
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Number of live mapping records (includes image exports)
    pub fn record_count(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Map a batch of items onto this device.
    ///
    /// Kernel and data-region batches return a handle for the matching
    /// release; enter-data batches persist through their records alone and
    /// return `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device allocator or a transfer fails.
    /// Consistency violations (forced-present misses, incompatible overlaps,
    /// partially mapped structs, unmapped pointees) are fatal and terminate
    /// the process.
    #[tracing::instrument(skip(self, request), fields(device = self.id, pragma = ?request.pragma, items = request.items.len()))]
    pub fn map_batch(&self, request: BatchRequest) -> Result<Option<BatchId>> {
        let result = {
            let mut state = self.state.lock();
            mapping::map_batch(self, &mut state, request)
        };
        check_fatal(result)
    }

    /// Launch the kernel whose host function address is `host_fn` with the
    /// argument block of `batch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch handle is stale or the backend launch
    /// fails. An unregistered kernel address is fatal.
    #[tracing::instrument(skip(self), fields(device = self.id, host_fn))]
    pub fn launch(&self, host_fn: u64, batch: BatchId) -> Result<()> {
        let result = {
            let state = self.state.lock();
            self.launch_locked(&state, host_fn, batch)
        };
        check_fatal(result)
    }

    fn launch_locked(&self, state: &DeviceState, host_fn: u64, batch: BatchId) -> Result<()> {
        let probe = HostRange::new(host_fn, host_fn);
        let (_, record) = state.index.lookup(&probe).ok_or(Error::NotPresent {
            start: host_fn,
            end: host_fn,
        })?;
        let entry = state.records[&record].device_base;
        let args = state
            .batches
            .get(&batch)
            .ok_or(Error::InvalidBatch(batch.0))?
            .arg_block
            .map(|block| block.base)
            .unwrap_or(DevicePtr::NULL);
        tracing::debug!(entry = %entry, args = %args, "launching kernel");
        self.backend.run(self.ordinal, entry, args)?;
        Ok(())
    }

    /// Release one reference to `batch`, copying back and destroying records
    /// whose last holder this was. `do_copy_back` gates ordinary from-copies;
    /// always-from items copy back regardless.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch handle is stale or a transfer fails.
    #[tracing::instrument(skip(self), fields(device = self.id, batch = %batch))]
    pub fn release_batch(&self, batch: BatchId, do_copy_back: bool) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            release::release(self, &mut state, batch, do_copy_back)
        };
        check_fatal(result)
    }

    /// Perform the copy-back half of a release early, transferring the
    /// batch's references to the asynchronous side. The matching
    /// [`release_batch`](Self::release_batch) later drops those asynchronous
    /// references without copying again.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch handle is stale or a transfer fails.
    #[tracing::instrument(skip(self), fields(device = self.id, batch = %batch))]
    pub fn async_copy_back(&self, batch: BatchId) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            release::async_copy_back(self, &mut state, batch)
        };
        check_fatal(result)
    }

    /// Release individual ranges outside any batch (exit-data). With
    /// `delete`, each found record is dropped regardless of its count.
    ///
    /// # Errors
    ///
    /// Returns an error if a transfer fails. A non-zero-length item with no
    /// record is fatal.
    #[tracing::instrument(skip(self, items), fields(device = self.id, items = items.len(), delete))]
    pub fn exit_partial(&self, items: &[MapItem], delete: bool) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            release::exit_partial(self, &mut state, items, delete)
        };
        check_fatal(result)
    }

    /// Whether `[host_addr, host_addr + len)` is fully covered by one record.
    /// Zero-length queries test for any enclosing record.
    pub fn is_present(&self, host_addr: u64, len: usize) -> bool {
        let state = self.state.lock();
        let probe = HostRange::with_len(host_addr, len);
        match state.index.lookup(&probe) {
            Some((_, record)) => probe.is_empty() || state.records[&record].host.contains_range(&probe),
            None => false,
        }
    }

    /// Per-item outcomes of an open batch, in request order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBatch`] for a stale handle.
    pub fn item_results(&self, batch: BatchId) -> Result<Vec<crate::batch::ItemResult>> {
        let state = self.state.lock();
        state
            .batches
            .get(&batch)
            .map(|b| b.results.clone())
            .ok_or(Error::InvalidBatch(batch.0))
    }

    /// Device address backing `host_addr`, if it is mapped
    pub fn device_addr(&self, host_addr: u64) -> Option<DevicePtr> {
        let state = self.state.lock();
        let probe = HostRange::new(host_addr, host_addr);
        let (_, record) = state.index.lookup(&probe)?;
        Some(state.records[&record].device_addr_of(host_addr))
    }

    /// Install a permanent caller-managed association between a host range
    /// and device storage. Re-associating an identical range is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssociateConflict`] if the range overlaps an
    /// existing, non-identical record.
    #[tracing::instrument(skip(self), fields(device = self.id, host = host_addr, len))]
    pub fn associate(&self, host_addr: u64, device_addr: DevicePtr, len: usize) -> Result<()> {
        let mut state = self.state.lock();
        let range = HostRange::with_len(host_addr, len);
        if let Some((_, id)) = state.index.lookup(&range) {
            let record = &state.records[&id];
            let identical = record.host.start == range.start
                && record.host.end == range.end
                && record.device_base == device_addr;
            return if identical {
                Ok(())
            } else {
                Err(Error::AssociateConflict { host: host_addr })
            };
        }
        let id = state.new_record_id();
        state.records.insert(
            id,
            MappingRecord {
                host: range,
                device_base: device_addr,
                owner: None,
                sync_refs: RefCount::Permanent,
                async_refs: 0,
                from_associate: true,
            },
        );
        state.index.insert(range, id);
        Ok(())
    }

    /// Remove an association previously installed by
    /// [`associate`](Self::associate). The device storage stays with the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRecord`] if nothing is mapped at `host_addr`, and
    /// [`Error::DisassociateNotEligible`] if the record was not created by
    /// `associate` or still has asynchronous holders.
    #[tracing::instrument(skip(self), fields(device = self.id, host = host_addr))]
    pub fn disassociate(&self, host_addr: u64) -> Result<()> {
        let mut state = self.state.lock();
        let probe = HostRange::with_len(host_addr, 1);
        let (range, id) = state
            .index
            .lookup(&probe)
            .ok_or(Error::NoRecord { host: host_addr })?;
        let record = &state.records[&id];
        if !record.from_associate || record.async_refs > 0 {
            return Err(Error::DisassociateNotEligible { host: host_addr });
        }
        state.index.remove(&range);
        state.records.remove(&id);
        Ok(())
    }

    // ---- backend plumbing (called with the state lock held) -----------------

    pub(crate) fn mark_initialized(&self, state: &mut DeviceState) -> Result<()> {
        self.backend.init(self.ordinal)?;
        state.initialized = true;
        Ok(())
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub(crate) fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Allocate a device buffer, promoting allocator failure to the fatal
    /// tier.
    pub(crate) fn alloc_buffer(&self, bytes: usize) -> Result<DeviceBuffer> {
        let base = self.backend.alloc(self.ordinal, bytes).map_err(|err| match err {
            BackendError::AllocationFailed { requested } => Error::AllocExhausted { requested },
            other => Error::Backend(other),
        })?;
        tracing::debug!(device = self.id, bytes, base = %base, "allocated device buffer");
        Ok(DeviceBuffer {
            base,
            len: bytes,
            owned: true,
        })
    }

    pub(crate) fn free_buffer(&self, buffer: &DeviceBuffer) -> Result<()> {
        if buffer.owned {
            tracing::debug!(device = self.id, base = %buffer.base, len = buffer.len, "freeing device buffer");
            self.backend.free(self.ordinal, buffer.base)?;
        }
        Ok(())
    }

    /// Host-to-device copy; zero-length copies are elided.
    pub(crate) fn copy_in(&self, dst: DevicePtr, src_host: u64, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        tracing::debug!(device = self.id, bytes = len, dst = %dst, direction = "H2D", "transfer");
        self.backend.host_to_device(self.ordinal, dst, src_host, len)?;
        Ok(())
    }

    /// Device-to-host copy; zero-length copies are elided.
    pub(crate) fn copy_out(&self, dst_host: u64, src: DevicePtr, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        tracing::debug!(device = self.id, bytes = len, src = %src, direction = "D2H", "transfer");
        self.backend.device_to_host(self.ordinal, dst_host, src, len)?;
        Ok(())
    }

    /// Same-device device-to-device copy.
    pub(crate) fn copy_within(&self, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        tracing::debug!(device = self.id, bytes = len, direction = "D2D", "transfer");
        self.backend.device_to_device(self.ordinal, dst, src, len)?;
        Ok(())
    }

    /// Tear the device down at process exit. Best-effort: failures are
    /// logged, not propagated.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        if !state.initialized {
            return;
        }
        for (_, batch) in state.batches.drain() {
            if let Some(buffer) = &batch.buffer {
                let _ = self.free_buffer(buffer);
            }
            if let Some(block) = &batch.arg_block {
                let _ = self.free_buffer(block);
            }
        }
        if let Err(err) = self.backend.fini(self.ordinal) {
            tracing::warn!(device = self.id, error = %err, "device teardown failed");
        }
        state.initialized = false;
    }
}
