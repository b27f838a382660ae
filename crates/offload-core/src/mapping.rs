//! Mapping engine: turns a batch of map items into device-resident state
//!
//! Mapping runs in two passes under the device lock. The **resolve** pass
//! walks the items in order, decides reuse-vs-create against the index, and
//! sizes one contiguous buffer for everything that needs fresh storage (each
//! new block aligned to its item's declared alignment; struct members land
//! at their natural offsets inside their header's block and are never
//! re-aligned). The **commit** pass performs the single allocation, creates
//! records, issues host-to-device copies, rewrites device-resident pointer
//! cells, and assembles the kernel argument block.
//!
//! Item order matters twice: struct headers and to-psets precede the member
//! items they cover, and a pointer cell's pointee must be resolvable by the
//! time the cell is committed (either already mapped or created earlier in
//! the same batch).

use offload_backends::DevicePtr;

use crate::batch::{Batch, BatchId, ItemResult, MappingRecord, RecordId};
use crate::device::{Device, DeviceState};
use crate::error::{Error, Result};
use crate::index::HostRange;
use crate::refcount::RefCount;

/// Data-movement direction of a mapped range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    /// Copy host to device at map time
    To,
    /// Copy device to host at release time
    From,
    /// Both directions
    ToFrom,
    /// Allocate only, no copies
    Alloc,
}

impl MapType {
    fn to_device(self) -> bool {
        matches!(self, MapType::To | MapType::ToFrom)
    }

    fn from_device(self) -> bool {
        matches!(self, MapType::From | MapType::ToFrom)
    }
}

/// What a map item describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Plain data range
    Data {
        /// Copy direction
        ty: MapType,
        /// Require an existing record; never allocate
        force_present: bool,
        /// Copy even when the record is reused / not last
        always: bool,
    },
    /// By-value argument embedded directly in the batch buffer; no record
    FirstPrivate,
    /// 8-byte pointer cell whose device copy is rewritten to point at the
    /// device copy of its pointee, minus `bias`
    Pointer {
        /// Bytes subtracted from the rebased device pointer value
        bias: u64,
    },
    /// Struct group header covering the next `members` items; the group
    /// shares one record spanning the header range
    StructHeader {
        /// Number of member items that follow
        members: usize,
    },
    /// Struct group header that is also copied to the device, covering the
    /// next `pointers` pointer-cell items rebased in place
    ToPset {
        /// Number of pointer items that follow
        pointers: usize,
    },
    /// Zero-length array section: attaches to an enclosing record if one
    /// exists, silently absent otherwise
    ZeroLenSection,
    /// Translate a host address to its device address without mapping
    UseDevicePtr,
}

/// One entry of a mapping request
#[derive(Debug, Clone, Copy)]
pub struct MapItem {
    /// Host address of the range
    pub host_addr: u64,
    /// Length in bytes
    pub size: usize,
    /// Item kind
    pub kind: ItemKind,
    /// log2 of the required buffer alignment for fresh storage
    pub log2_align: u8,
}

impl MapItem {
    const DEFAULT_LOG2_ALIGN: u8 = 3;

    fn data(ty: MapType, host_addr: u64, size: usize) -> Self {
        Self {
            host_addr,
            size,
            kind: ItemKind::Data {
                ty,
                force_present: false,
                always: false,
            },
            log2_align: Self::DEFAULT_LOG2_ALIGN,
        }
    }

    /// Map with a host-to-device copy
    pub fn to(host_addr: u64, size: usize) -> Self {
        Self::data(MapType::To, host_addr, size)
    }

    /// Map with a device-to-host copy on release
    pub fn from(host_addr: u64, size: usize) -> Self {
        Self::data(MapType::From, host_addr, size)
    }

    /// Map with copies in both directions
    pub fn tofrom(host_addr: u64, size: usize) -> Self {
        Self::data(MapType::ToFrom, host_addr, size)
    }

    /// Map storage only
    pub fn alloc(host_addr: u64, size: usize) -> Self {
        Self::data(MapType::Alloc, host_addr, size)
    }

    /// Embed a by-value argument in the batch buffer
    pub fn firstprivate(host_addr: u64, size: usize) -> Self {
        Self {
            host_addr,
            size,
            kind: ItemKind::FirstPrivate,
            log2_align: Self::DEFAULT_LOG2_ALIGN,
        }
    }

    /// Map a pointer cell and rebase its device copy
    pub fn pointer(host_addr: u64, bias: u64) -> Self {
        Self {
            host_addr,
            size: 8,
            kind: ItemKind::Pointer { bias },
            log2_align: Self::DEFAULT_LOG2_ALIGN,
        }
    }

    /// Open a struct group covering the next `members` items
    pub fn struct_header(host_addr: u64, size: usize, members: usize) -> Self {
        Self {
            host_addr,
            size,
            kind: ItemKind::StructHeader { members },
            log2_align: Self::DEFAULT_LOG2_ALIGN,
        }
    }

    /// Open a to-pset covering the next `pointers` pointer items
    pub fn to_pset(host_addr: u64, size: usize, pointers: usize) -> Self {
        Self {
            host_addr,
            size,
            kind: ItemKind::ToPset { pointers },
            log2_align: Self::DEFAULT_LOG2_ALIGN,
        }
    }

    /// Zero-length array section probe
    pub fn zero_len(host_addr: u64) -> Self {
        Self {
            host_addr,
            size: 0,
            kind: ItemKind::ZeroLenSection,
            log2_align: Self::DEFAULT_LOG2_ALIGN,
        }
    }

    /// Address translation without mapping
    pub fn use_device_ptr(host_addr: u64) -> Self {
        Self {
            host_addr,
            size: 0,
            kind: ItemKind::UseDevicePtr,
            log2_align: Self::DEFAULT_LOG2_ALIGN,
        }
    }

    /// Require the range to be present already (data items only)
    pub fn force_present(mut self) -> Self {
        if let ItemKind::Data { force_present, .. } = &mut self.kind {
            *force_present = true;
        }
        self
    }

    /// Copy even on reuse / before the last release (data items only)
    pub fn always(mut self) -> Self {
        if let ItemKind::Data { always, .. } = &mut self.kind {
            *always = true;
        }
        self
    }

    /// Override the fresh-storage alignment
    pub fn with_log2_align(mut self, log2_align: u8) -> Self {
        self.log2_align = log2_align;
        self
    }

    /// Host range this item covers
    pub fn range(&self) -> HostRange {
        HostRange::with_len(self.host_addr, self.size)
    }

    fn copies_to(&self) -> bool {
        match self.kind {
            ItemKind::Data { ty, .. } => ty.to_device(),
            ItemKind::ToPset { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn copies_from(&self) -> bool {
        matches!(self.kind, ItemKind::Data { ty, .. } if ty.from_device())
    }

    fn is_always(&self) -> bool {
        matches!(self.kind, ItemKind::Data { always: true, .. })
    }

    pub(crate) fn always_from(&self) -> bool {
        self.is_always() && self.copies_from()
    }

    fn is_force_present(&self) -> bool {
        matches!(
            self.kind,
            ItemKind::Data {
                force_present: true,
                ..
            }
        )
    }
}

/// Construct that issued a mapping request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PragmaKind {
    /// Map, launch, release around one kernel
    Kernel,
    /// Structured data region: mappings outlive the call until the matching
    /// release
    DataRegion,
    /// Unstructured enter-data: mappings persist through their records, no
    /// handle is returned
    EnterData,
}

/// A full mapping request
#[derive(Debug)]
pub struct BatchRequest {
    /// Construct kind
    pub pragma: PragmaKind,
    /// Items in source order
    pub items: Vec<MapItem>,
    /// Optional caller-supplied device storage, one slot per item. Empty
    /// means none supplied.
    pub device_addrs: Vec<Option<DevicePtr>>,
}

impl BatchRequest {
    /// Request with engine-allocated storage
    pub fn new(pragma: PragmaKind, items: Vec<MapItem>) -> Self {
        Self {
            pragma,
            items,
            device_addrs: Vec::new(),
        }
    }

    /// Attach caller-supplied device storage
    pub fn with_device_addrs(mut self, device_addrs: Vec<Option<DevicePtr>>) -> Self {
        self.device_addrs = device_addrs;
        self
    }

    fn supplied(&self, item: usize) -> Option<DevicePtr> {
        self.device_addrs.get(item).copied().flatten()
    }
}

/// Sizes the batch buffer during the resolve pass and replays the same
/// offsets during commit
#[derive(Debug, Default)]
struct LayoutAccumulator {
    cursor: usize,
}

impl LayoutAccumulator {
    /// Reserve `size` bytes aligned to `1 << log2_align`, returning the
    /// block's offset
    fn place(&mut self, size: usize, log2_align: u8) -> usize {
        let align = 1usize << log2_align;
        let offset = (self.cursor + align - 1) & !(align - 1);
        self.cursor = offset + size;
        offset
    }

    fn total(&self) -> usize {
        self.cursor
    }
}

/// Resolve-pass decision for one item
#[derive(Debug, Clone, Copy)]
enum Plan {
    /// Attach to an existing record
    Reuse { record: RecordId },
    /// Own a fresh block
    Create { pending: usize },
    /// Share the fresh block of an earlier item in this batch
    Member { pending: usize },
    /// Translate only, no record involvement
    UseDevice { record: RecordId },
    /// Zero-length probe found nothing; not an error
    Absent,
}

/// A block the commit pass must create
#[derive(Debug)]
struct PendingBlock {
    range: HostRange,
    offset: usize,
    supplied: Option<DevicePtr>,
    /// Whether the block gets a mapping record (firstprivate blocks are
    /// record-less and never shareable)
    has_record: bool,
}

/// Find a record fully containing `range`. Overlap without containment is
/// an index-consistency violation.
fn lookup_containing(state: &DeviceState, range: &HostRange) -> Result<Option<RecordId>> {
    match state.index.lookup(range) {
        Some((_, id)) if state.records[&id].host.contains_range(range) => Ok(Some(id)),
        Some(_) => Err(Error::IncompatibleMapping {
            start: range.start,
            end: range.end,
        }),
        None => Ok(None),
    }
}

/// Find an earlier block in the same batch that fully contains `range`.
/// Items may name the same host range more than once in one request; the
/// later occurrences share the first one's block instead of colliding in the
/// index. Overlap without containment is rejected, same as against the index.
fn lookup_pending(pending: &[PendingBlock], range: &HostRange) -> Result<Option<usize>> {
    if range.is_empty() {
        return Ok(None);
    }
    for (ix, block) in pending.iter().enumerate() {
        if !block.has_record {
            continue;
        }
        if block.range.contains_range(range) {
            return Ok(Some(ix));
        }
        if block.range.overlaps(range) {
            return Err(Error::IncompatibleMapping {
                start: range.start,
                end: range.end,
            });
        }
    }
    Ok(None)
}

fn group_members(item: &MapItem) -> Option<usize> {
    match item.kind {
        ItemKind::StructHeader { members } => Some(members),
        ItemKind::ToPset { pointers } => Some(pointers),
        _ => None,
    }
}

fn validate_groups(items: &[MapItem]) -> Result<()> {
    let mut i = 0;
    while i < items.len() {
        if let Some(members) = group_members(&items[i]) {
            if i + members >= items.len() {
                return Err(Error::InternalKind("truncated struct group"));
            }
            for member in &items[i + 1..=i + members] {
                match member.kind {
                    ItemKind::Data { .. } | ItemKind::Pointer { .. } => {}
                    _ => return Err(Error::InternalKind("struct group member")),
                }
            }
            i += members + 1;
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn resolve(
    state: &DeviceState,
    request: &BatchRequest,
) -> Result<(Vec<Plan>, Vec<PendingBlock>, usize)> {
    let items = &request.items;
    let mut plans = Vec::with_capacity(items.len());
    let mut pending: Vec<PendingBlock> = Vec::new();
    let mut layout = LayoutAccumulator::default();

    let mut i = 0;
    while i < items.len() {
        let item = &items[i];

        if let Some(members) = group_members(item) {
            let span = item.range();
            match lookup_containing(state, &span)? {
                Some(record) => {
                    let host = state.records[&record].host;
                    plans.push(Plan::Reuse { record });
                    for member in &items[i + 1..=i + members] {
                        let mrange = member.range();
                        if !host.contains_range(&mrange) {
                            return Err(Error::PartialStructMapping {
                                start: mrange.start,
                                end: mrange.end,
                            });
                        }
                        plans.push(Plan::Reuse { record });
                    }
                }
                None => {
                    let (block, span) = match lookup_pending(&pending, &span)? {
                        Some(block) => {
                            plans.push(Plan::Member { pending: block });
                            (block, pending[block].range)
                        }
                        None => {
                            let supplied = request.supplied(i);
                            let offset = match supplied {
                                Some(_) => 0,
                                None => layout.place(span.len(), item.log2_align),
                            };
                            let block = pending.len();
                            pending.push(PendingBlock {
                                range: span,
                                offset,
                                supplied,
                                has_record: true,
                            });
                            plans.push(Plan::Create { pending: block });
                            (block, span)
                        }
                    };
                    for member in &items[i + 1..=i + members] {
                        let mrange = member.range();
                        if !span.contains_range(&mrange) {
                            return Err(Error::PartialStructMapping {
                                start: mrange.start,
                                end: mrange.end,
                            });
                        }
                        plans.push(Plan::Member { pending: block });
                    }
                }
            }
            i += members + 1;
            continue;
        }

        let plan = match item.kind {
            ItemKind::ZeroLenSection => match lookup_containing(state, &item.range())? {
                Some(record) => Plan::Reuse { record },
                None => Plan::Absent,
            },
            ItemKind::UseDevicePtr => {
                let probe = HostRange::new(item.host_addr, item.host_addr);
                match state.index.lookup(&probe) {
                    Some((_, record)) => Plan::UseDevice { record },
                    None => Plan::Absent,
                }
            }
            ItemKind::FirstPrivate => {
                let block = pending.len();
                pending.push(PendingBlock {
                    range: item.range(),
                    offset: layout.place(item.size, item.log2_align),
                    supplied: None,
                    has_record: false,
                });
                Plan::Create { pending: block }
            }
            ItemKind::Data { .. } | ItemKind::Pointer { .. } => {
                let range = item.range();
                match lookup_containing(state, &range)? {
                    Some(record) => Plan::Reuse { record },
                    None => match lookup_pending(&pending, &range)? {
                        Some(block) => Plan::Member { pending: block },
                        None if item.is_force_present() => {
                            return Err(Error::NotPresent {
                                start: range.start,
                                end: range.end,
                            })
                        }
                        None if range.is_empty() => Plan::Absent,
                        None => {
                            let supplied = request.supplied(i);
                            let offset = match supplied {
                                Some(_) => 0,
                                None => layout.place(item.size, item.log2_align),
                            };
                            let block = pending.len();
                            pending.push(PendingBlock {
                                range,
                                offset,
                                supplied,
                                has_record: true,
                            });
                            Plan::Create { pending: block }
                        }
                    },
                }
            }
            ItemKind::StructHeader { .. } | ItemKind::ToPset { .. } => {
                return Err(Error::InternalKind("group header"))
            }
        };
        plans.push(plan);
        i += 1;
    }

    Ok((plans, pending, layout.total()))
}

/// Read the host pointer value stored in a pointer cell.
fn read_host_pointer(cell_addr: u64) -> u64 {
    // Safety: the caller of the mapping API guarantees every item references
    // live host memory; a pointer cell holds one readable u64.
    unsafe { (cell_addr as usize as *const u64).read_unaligned() }
}

/// Compute and write a pointer cell's device-resident value.
fn rebase_pointer(
    device: &Device,
    state: &DeviceState,
    cell_dev: DevicePtr,
    cell_host: u64,
    bias: u64,
) -> Result<()> {
    let pointee = read_host_pointer(cell_host);
    let probe = HostRange::new(pointee, pointee);
    let (_, record) = state
        .index
        .lookup(&probe)
        .ok_or(Error::PointeeNotMapped { pointee })?;
    let rebased = state.records[&record]
        .device_addr_of(pointee)
        .addr()
        .wrapping_sub(bias);
    device.copy_in(cell_dev, &rebased as *const u64 as u64, 8)
}

/// Map a batch of items. Called with the device lock held.
pub(crate) fn map_batch(
    device: &Device,
    state: &mut DeviceState,
    request: BatchRequest,
) -> Result<Option<BatchId>> {
    validate_groups(&request.items)?;
    let (plans, pending, total) = resolve(state, &request)?;

    let buffer = if total > 0 {
        Some(device.alloc_buffer(total)?)
    } else {
        None
    };

    let id = state.new_batch_id();
    let mut batch = Batch::new(id);
    batch.buffer = buffer;

    // The resolve pass placed every unsupplied block, so a buffer exists
    // whenever the fallback arm is reached.
    let buffer_base = batch.buffer.map(|b| b.base);
    let block_base = move |block: &PendingBlock| -> DevicePtr {
        match block.supplied {
            Some(addr) => addr,
            None => buffer_base
                .map(|base| base.offset(block.offset as u64))
                .unwrap_or(DevicePtr::NULL),
        }
    };
    let mut created: Vec<Option<RecordId>> = vec![None; pending.len()];

    for (i, item) in request.items.iter().enumerate() {
        let result = match plans[i] {
            Plan::Absent => ItemResult {
                host: item.range(),
                record: None,
                device_addr: None,
                copy_from: false,
                always_copy_from: false,
                deferred: false,
                copied: false,
                released: false,
            },
            Plan::UseDevice { record } => {
                let rec = &state.records[&record];
                let addr = if rec.host.contains_point(item.host_addr) || rec.host.start == item.host_addr {
                    Some(rec.device_addr_of(item.host_addr))
                } else {
                    None
                };
                ItemResult {
                    host: item.range(),
                    record: None,
                    device_addr: addr,
                    copy_from: false,
                    always_copy_from: false,
                    deferred: false,
                    copied: false,
                    released: false,
                }
            }
            Plan::Reuse { record } => {
                let rec = state
                    .records
                    .get_mut(&record)
                    .ok_or(Error::InternalKind("record slab"))?;
                rec.sync_refs.increment();
                let device_addr = rec.device_addr_of(item.host_addr);
                tracing::debug!(record = %record, refs = %rec.sync_refs, host = %item.range(), "record reused");
                if item.copies_to() && item.is_always() {
                    device.copy_in(device_addr, item.host_addr, item.size)?;
                }
                ItemResult {
                    host: item.range(),
                    record: Some(record),
                    device_addr: Some(device_addr),
                    copy_from: item.copies_from(),
                    always_copy_from: item.always_from(),
                    deferred: false,
                    copied: false,
                    released: false,
                }
            }
            Plan::Create { pending: block_ix } => {
                let block = &pending[block_ix];
                let device_base = block_base(block);

                if matches!(item.kind, ItemKind::FirstPrivate) {
                    device.copy_in(device_base, item.host_addr, item.size)?;
                    ItemResult {
                        host: item.range(),
                        record: None,
                        device_addr: Some(device_base),
                        copy_from: false,
                        always_copy_from: false,
                        deferred: false,
                        copied: false,
                        released: false,
                    }
                } else {
                    let record = state.new_record_id();
                    state.records.insert(
                        record,
                        MappingRecord {
                            host: block.range,
                            device_base,
                            owner: Some(id),
                            sync_refs: RefCount::ONE,
                            async_refs: 0,
                            from_associate: false,
                        },
                    );
                    if state.index.insert(block.range, record).is_some() {
                        return Err(Error::InternalKind("index collision"));
                    }
                    batch.owned_records.push(record);
                    created[block_ix] = Some(record);
                    tracing::debug!(record = %record, host = %block.range, base = %device_base, "record created");

                    if let ItemKind::Pointer { bias } = item.kind {
                        rebase_pointer(device, state, device_base, item.host_addr, bias)?;
                    } else if item.copies_to() {
                        device.copy_in(device_base, item.host_addr, item.size)?;
                    }
                    ItemResult {
                        host: item.range(),
                        record: Some(record),
                        device_addr: Some(device_base),
                        copy_from: item.copies_from(),
                        always_copy_from: item.always_from(),
                        deferred: false,
                        copied: false,
                        released: false,
                    }
                }
            }
            Plan::Member { pending: block_ix } => {
                let record = created[block_ix].ok_or(Error::InternalKind("member before header"))?;
                let rec = state
                    .records
                    .get_mut(&record)
                    .ok_or(Error::InternalKind("record slab"))?;
                rec.sync_refs.increment();
                let device_addr = rec.device_addr_of(item.host_addr);
                match item.kind {
                    ItemKind::Pointer { bias } => {
                        rebase_pointer(device, state, device_addr, item.host_addr, bias)?;
                    }
                    _ if item.copies_to() => {
                        device.copy_in(device_addr, item.host_addr, item.size)?;
                    }
                    _ => {}
                }
                ItemResult {
                    host: item.range(),
                    record: Some(record),
                    device_addr: Some(device_addr),
                    copy_from: item.copies_from(),
                    always_copy_from: item.always_from(),
                    deferred: false,
                    copied: false,
                    released: false,
                }
            }
        };
        batch.results.push(result);
    }

    if matches!(request.pragma, PragmaKind::Kernel) && !batch.results.is_empty() {
        let words: Vec<u64> = request
            .items
            .iter()
            .zip(&batch.results)
            .map(|(item, result)| {
                result
                    .device_addr
                    .map(DevicePtr::addr)
                    .unwrap_or(item.host_addr)
            })
            .collect();
        let bytes = words.len() * std::mem::size_of::<u64>();
        let block = device.alloc_buffer(bytes)?;
        device.copy_in(block.base, words.as_ptr() as u64, bytes)?;
        batch.arg_block = Some(block);
    }

    match request.pragma {
        PragmaKind::Kernel => {
            state.batches.insert(id, batch);
            Ok(Some(id))
        }
        PragmaKind::DataRegion => {
            batch.previous = state.open_region;
            state.open_region = Some(id);
            state.batches.insert(id, batch);
            Ok(Some(id))
        }
        PragmaKind::EnterData => {
            batch.refcount = 0;
            if batch.is_drained() {
                // Pure-reuse enter-data: nothing to keep.
                if let Some(buffer) = &batch.buffer {
                    device.free_buffer(buffer)?;
                }
            } else {
                state.batches.insert(id, batch);
            }
            Ok(None)
        }
    }
}
