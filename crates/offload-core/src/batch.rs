//! Batches, mapping records, and their handles
//!
//! A `Batch` is one mapping transaction: it owns at most one contiguous
//! device buffer, the set of mapping records it newly created, and one
//! `ItemResult` per input item. Records and batches are stored in per-device
//! slabs and referenced by id; everything here is mutated only under the
//! owning device's lock.

use std::fmt;

use offload_backends::DevicePtr;

use crate::index::HostRange;
use crate::refcount::RefCount;

/// Handle to a mapping record in a device's record slab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec{}", self.0)
    }
}

/// Handle to an open batch on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch{}", self.0)
    }
}

/// Index entry associating a host range with its device-side location
#[derive(Debug)]
pub struct MappingRecord {
    /// Host range this record covers (unique per device while live)
    pub host: HostRange,
    /// Device address of `host.start`
    pub device_base: DevicePtr,
    /// Batch that created this record, if any (image exports and explicit
    /// associations are batch-less)
    pub owner: Option<BatchId>,
    /// Live synchronous holders, or permanent
    pub sync_refs: RefCount,
    /// In-flight asynchronous copy-back holders beyond the synchronous count
    pub async_refs: u32,
    /// Created by an explicit `associate` call (gates disassociation)
    pub from_associate: bool,
}

impl MappingRecord {
    /// Device address backing the host address `addr`, which must lie within
    /// this record's range.
    pub fn device_addr_of(&self, addr: u64) -> DevicePtr {
        debug_assert!(self.host.contains_point(addr) || addr == self.host.start);
        self.device_base.offset(addr - self.host.start)
    }

    /// Whether any holder, synchronous or asynchronous, still references
    /// this record
    pub fn is_live(&self) -> bool {
        !self.sync_refs.is_drained() || self.async_refs > 0
    }
}

/// Contiguous device buffer owned by a batch
#[derive(Debug, Clone, Copy)]
pub struct DeviceBuffer {
    /// Base device address
    pub base: DevicePtr,
    /// Length in bytes
    pub len: usize,
    /// Whether the batch allocated the buffer (caller-supplied device
    /// pointers are adopted, never freed)
    pub owned: bool,
}

/// Per-item outcome of a mapping request
#[derive(Debug, Clone, Copy)]
pub struct ItemResult {
    /// Host range the item used
    pub host: HostRange,
    /// Backing record, if any (values embedded directly in the buffer and
    /// use-device-ptr translations have none)
    pub record: Option<RecordId>,
    /// Resolved device address of the item
    pub device_addr: Option<DevicePtr>,
    /// Copy back on release when the caller requests copy-back
    pub copy_from: bool,
    /// Copy back on release unconditionally
    pub always_copy_from: bool,
    /// This batch's reference was transferred to the record's asynchronous
    /// count by a prior async copy-back
    pub deferred: bool,
    /// Copy-back already performed by a prior async copy-back or a partially
    /// completed release
    pub copied: bool,
    /// Reference already given back by a release attempt that failed later;
    /// a retried release must not decrement again
    pub released: bool,
}

/// One offload transaction: device buffer, owned records, item results
#[derive(Debug)]
pub struct Batch {
    /// Handle of this batch
    pub id: BatchId,
    /// Device buffer backing the records this batch created
    pub buffer: Option<DeviceBuffer>,
    /// Device-resident kernel argument block (kernel batches only)
    pub arg_block: Option<DeviceBuffer>,
    /// Records created by this batch, removed as they are released
    pub owned_records: Vec<RecordId>,
    /// One result per input item, in input order
    pub results: Vec<ItemResult>,
    /// Nested/aliased batches sharing this buffer
    pub refcount: u32,
    /// Link to the enclosing open data-region batch
    pub previous: Option<BatchId>,
}

impl Batch {
    /// Create an empty batch
    pub fn new(id: BatchId) -> Self {
        Self {
            id,
            buffer: None,
            arg_block: None,
            owned_records: Vec::new(),
            results: Vec::new(),
            refcount: 1,
            previous: None,
        }
    }

    /// Whether the batch can be destroyed: no handle references remain and
    /// every record it created has been released
    pub fn is_drained(&self) -> bool {
        self.refcount == 0 && self.owned_records.is_empty()
    }
}
