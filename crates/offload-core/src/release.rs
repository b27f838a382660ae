//! Release engine: refcount-driven teardown of mappings
//!
//! Release is the mirror of mapping: every item result that holds a record
//! reference gives it back, and a record whose last holder leaves is copied
//! back (if its map type asks for it), removed from the index, and dropped.
//! Batch storage is freed only when the batch itself drains: no handle
//! references remain and every record it created is gone. Records can
//! outlive their creating batch's handle (enter-data, reuse across batches),
//! so batch teardown and record teardown are decoupled.
//!
//! The asynchronous variant performs the copy-back half early and parks the
//! batch's references on the records' asynchronous counts; the ordinary
//! release later drops those without copying again. Completion-before-release
//! ordering is the caller's responsibility.

use crate::batch::{Batch, BatchId, RecordId};
use crate::device::{Device, DeviceState};
use crate::error::{Error, Result};
use crate::mapping::MapItem;

/// Free a drained batch's device storage.
fn destroy_batch(device: &Device, batch: &Batch) -> Result<()> {
    tracing::debug!(batch = %batch.id, "destroying batch");
    if let Some(buffer) = &batch.buffer {
        device.free_buffer(buffer)?;
    }
    if let Some(block) = &batch.arg_block {
        device.free_buffer(block)?;
    }
    Ok(())
}

/// Remove a dead record from the index and the slab, and detach it from its
/// owning batch. `current`, when given, is a batch already taken out of the
/// slab by the caller.
fn destroy_record(
    device: &Device,
    state: &mut DeviceState,
    id: RecordId,
    current: Option<&mut Batch>,
) -> Result<()> {
    let record = match state.records.remove(&id) {
        Some(record) => record,
        None => return Ok(()),
    };
    state.index.remove(&record.host);
    tracing::debug!(record = %id, host = %record.host, "destroying record");

    let Some(owner) = record.owner else {
        return Ok(());
    };

    if let Some(batch) = current {
        if batch.id == owner {
            batch.owned_records.retain(|r| *r != id);
            return Ok(());
        }
    }
    if let Some(batch) = state.batches.get_mut(&owner) {
        batch.owned_records.retain(|r| *r != id);
        if batch.is_drained() {
            let batch = state
                .batches
                .remove(&owner)
                .ok_or(Error::InternalKind("batch slab"))?;
            destroy_batch(device, &batch)?;
        }
    }
    Ok(())
}

/// Release one reference to a batch. Called with the device lock held.
///
/// A release that fails part-way (a backend transfer or free error) puts the
/// batch back into the slab, so the handle stays valid and the caller can
/// retry. Per-result flags record which references were already given back
/// and which copy-backs already ran, so a retry resumes where the failed
/// attempt stopped instead of double-dropping.
pub(crate) fn release(
    device: &Device,
    state: &mut DeviceState,
    id: BatchId,
    do_copy_back: bool,
) -> Result<()> {
    let mut batch = state
        .batches
        .remove(&id)
        .ok_or(Error::InvalidBatch(id.0))?;

    if let Err(err) = release_results(device, state, &mut batch, do_copy_back) {
        state.batches.insert(id, batch);
        return Err(err);
    }

    batch.refcount = batch.refcount.saturating_sub(1);
    if state.open_region == Some(id) && batch.refcount == 0 {
        state.open_region = batch.previous;
    }

    if batch.is_drained() {
        if let Err(err) = destroy_batch(device, &batch) {
            state.batches.insert(id, batch);
            return Err(err);
        }
    } else {
        state.batches.insert(id, batch);
    }
    Ok(())
}

/// Give back each result's record reference and tear down records whose last
/// holder left.
fn release_results(
    device: &Device,
    state: &mut DeviceState,
    batch: &mut Batch,
    do_copy_back: bool,
) -> Result<()> {
    for i in 0..batch.results.len() {
        let result = batch.results[i];
        let Some(record_id) = result.record else {
            continue;
        };
        let Some(record) = state.records.get_mut(&record_id) else {
            // Already dropped through exit-data or delete.
            continue;
        };
        if record.sync_refs.is_permanent() {
            continue;
        }

        if !result.released {
            if result.deferred {
                record.async_refs = record.async_refs.saturating_sub(1);
            } else {
                record.sync_refs.decrement();
            }
            batch.results[i].released = true;
        }
        if record.is_live() {
            continue;
        }

        let wants_copy = (result.copy_from && do_copy_back) || result.always_copy_from;
        if wants_copy && !result.copied {
            let src = record.device_addr_of(result.host.start);
            device.copy_out(result.host.start, src, result.host.len())?;
            batch.results[i].copied = true;
        }
        destroy_record(device, state, record_id, Some(&mut *batch))?;
    }
    Ok(())
}

/// Perform the copy-back half of a release early. Called with the device
/// lock held.
///
/// For each record-holding result: if other synchronous holders remain, the
/// batch's reference moves to the record's asynchronous count and the actual
/// copy is deferred to whichever holder leaves last. If this batch is the
/// last synchronous holder, the copy-back happens now and the later release
/// only drops the reference.
pub(crate) fn async_copy_back(device: &Device, state: &mut DeviceState, id: BatchId) -> Result<()> {
    let DeviceState {
        records, batches, ..
    } = state;
    let batch = batches.get_mut(&id).ok_or(Error::InvalidBatch(id.0))?;

    for result in batch.results.iter_mut() {
        let Some(record_id) = result.record else {
            continue;
        };
        let Some(record) = records.get_mut(&record_id) else {
            continue;
        };
        if record.sync_refs.is_permanent() {
            continue;
        }

        if matches!(record.sync_refs.count(), Some(n) if n > 1) {
            record.sync_refs.decrement();
            record.async_refs += 1;
            result.deferred = true;
            tracing::debug!(record = %record_id, "copy-back deferred to remaining holders");
            continue;
        }

        let wants_copy = result.copy_from || result.always_copy_from;
        if wants_copy && !result.copied {
            let src = record.device_addr_of(result.host.start);
            device.copy_out(result.host.start, src, result.host.len())?;
            result.copied = true;
        }
    }
    Ok(())
}

/// Release individual host ranges outside any batch. Called with the device
/// lock held.
pub(crate) fn exit_partial(
    device: &Device,
    state: &mut DeviceState,
    items: &[MapItem],
    delete: bool,
) -> Result<()> {
    for item in items {
        let probe = item.range();
        let found = state.index.lookup(&probe);
        let record_id = match found {
            Some((_, record_id)) => record_id,
            None if probe.is_empty() || delete => continue,
            None => {
                return Err(Error::NotPresent {
                    start: probe.start,
                    end: probe.end,
                })
            }
        };
        let record = state
            .records
            .get_mut(&record_id)
            .ok_or(Error::InternalKind("record slab"))?;
        if !probe.is_empty() && !record.host.contains_range(&probe) {
            return Err(Error::IncompatibleMapping {
                start: probe.start,
                end: probe.end,
            });
        }
        if record.sync_refs.is_permanent() {
            continue;
        }

        if delete {
            // Drop every synchronous holder at once.
            while !record.sync_refs.is_drained() {
                record.sync_refs.decrement();
            }
        } else {
            record.sync_refs.decrement();
        }
        if record.is_live() {
            continue;
        }

        if item.copies_from() || item.always_from() {
            let src = record.device_addr_of(probe.start);
            device.copy_out(probe.start, src, probe.len())?;
        }
        destroy_record(device, state, record_id, None)?;
    }
    Ok(())
}
