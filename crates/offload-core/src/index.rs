//! Address-range index: the per-device ordered interval map
//!
//! The index maps half-open host byte ranges to record ids. Its ordering is
//! deliberately unusual: two ranges compare **equal if they overlap at all**,
//! so both exact-range and point lookups resolve to any overlapping record
//! and callers validate exact containment afterward. Live keys never overlap
//! (at most one record per host range on a device), which keeps the ordering
//! total over everything actually stored.
//!
//! Zero-length ranges (function addresses, zero-length array-section probes)
//! never overlap anything, so they get a special-cased lookup: first the
//! exact zero-length key, then the immediately preceding and following byte
//! to find an enclosing record.
//!
//! Every operation here runs under the owning device's lock; the index is
//! never touched concurrently without it.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::batch::RecordId;

/// Half-open byte interval in host-addressable memory
#[derive(Debug, Clone, Copy)]
pub struct HostRange {
    /// First byte of the range
    pub start: u64,
    /// One past the last byte
    pub end: u64,
}

impl HostRange {
    /// Create a range from its bounds
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Create a range from a base address and a length
    pub fn with_len(start: u64, len: usize) -> Self {
        Self {
            start,
            end: start + len as u64,
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Whether the range is zero-length
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `other` lies entirely within this range
    pub fn contains_range(&self, other: &HostRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the byte at `addr` lies within this range
    pub fn contains_point(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Whether the two ranges share at least one byte
    pub fn overlaps(&self, other: &HostRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for HostRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

impl PartialEq for HostRange {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HostRange {}

impl PartialOrd for HostRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HostRange {
    /// Overlapping ranges compare equal; so does a zero-length range against
    /// any range starting at the same address. Everything else orders by
    /// start. This comparison is load-bearing for zero-length probes: do not
    /// replace it with strict interval ordering.
    fn cmp(&self, other: &Self) -> Ordering {
        if self.overlaps(other) || (self.start == other.start && (self.is_empty() || other.is_empty())) {
            Ordering::Equal
        } else {
            self.start.cmp(&other.start)
        }
    }
}

/// Per-device ordered interval map from host ranges to record ids
#[derive(Debug, Default)]
pub struct RangeIndex {
    map: BTreeMap<HostRange, RecordId>,
}

impl RangeIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record for a host range.
    ///
    /// Returns the displaced record id if the range collides with an
    /// existing key; callers treat that as an index-consistency violation.
    pub fn insert(&mut self, range: HostRange, id: RecordId) -> Option<RecordId> {
        self.map.insert(range, id)
    }

    /// Remove the record stored for a range
    pub fn remove(&mut self, range: &HostRange) -> Option<RecordId> {
        self.map.remove(range)
    }

    /// Find the record overlapping `probe`.
    ///
    /// For non-empty probes this returns any overlapping record (callers
    /// validate containment). For zero-length probes it tries the exact
    /// zero-length key, then the preceding and following byte, and only
    /// returns an enclosing record that strictly contains the probe point.
    pub fn lookup(&self, probe: &HostRange) -> Option<(HostRange, RecordId)> {
        if !probe.is_empty() {
            return self.map.get_key_value(probe).map(|(r, id)| (*r, *id));
        }

        let point = probe.start;

        // Exact zero-length key, or a record starting exactly at the point.
        if let Some((range, id)) = self.map.get_key_value(probe) {
            if (range.is_empty() && range.start == point) || range.contains_point(point) {
                return Some((*range, *id));
            }
        }

        // Preceding byte: catches enclosing records that start before the
        // point. A record ending exactly at the point is rejected by the
        // containment check (half-open).
        if point > 0 {
            let before = HostRange::new(point - 1, point);
            if let Some((range, id)) = self.map.get_key_value(&before) {
                if range.contains_point(point) {
                    return Some((*range, *id));
                }
            }
        }

        // Following byte.
        let after = HostRange::new(point, point + 1);
        if let Some((range, id)) = self.map.get_key_value(&after) {
            if range.contains_point(point) {
                return Some((*range, *id));
            }
        }

        None
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index holds no records
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over all live entries in range order
    pub fn iter(&self) -> impl Iterator<Item = (&HostRange, &RecordId)> {
        self.map.iter()
    }
}
