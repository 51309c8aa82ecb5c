//! Differences between two snapshots of one trace.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::Snapshot;
use crate::types::{Address, Handle, ProcessId, SegmentId, SegmentKind, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentDelta {
    pub segment: SegmentId,
    pub kind: Option<SegmentKind>,
    pub allocation_count: i64,
    pub resource_count: i64,
    pub bound: i64,
    pub unbound: i64,
    pub committed: i64,
}

impl SegmentDelta {
    pub fn is_zero(&self) -> bool {
        self.allocation_count == 0
            && self.resource_count == 0
            && self.bound == 0
            && self.unbound == 0
            && self.committed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct AllocationRef {
    pub process: ProcessId,
    pub base: Address,
    pub created: Timestamp,
    pub handle: Handle,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDelta {
    pub base_timestamp: Timestamp,
    pub diff_timestamp: Timestamp,
    pub segments: Vec<SegmentDelta>,
    /// Canonical ids live in both snapshots.
    pub common: Vec<Handle>,
    pub only_in_base: Vec<Handle>,
    pub only_in_diff: Vec<Handle>,
    pub allocations_added: Vec<AllocationRef>,
    pub allocations_removed: Vec<AllocationRef>,
}

fn signed(a: u64, b: u64) -> i64 {
    (b as i128 - a as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn allocations(snapshot: &Snapshot) -> BTreeMap<(ProcessId, Address, Timestamp), AllocationRef> {
    snapshot
        .virtual_allocations()
        .map(|(_, a)| {
            (
                (a.process, a.base, a.created),
                AllocationRef {
                    process: a.process,
                    base: a.base,
                    created: a.created,
                    handle: a.handle,
                    size: a.size_bytes(),
                },
            )
        })
        .collect()
}

/// What changed going from `base` to `diff`. Deltas are `diff - base`.
pub fn compare(base: &Snapshot, diff: &Snapshot) -> SnapshotDelta {
    let segment_count = base.segments().len().max(diff.segments().len());
    let segments = (0..segment_count)
        .map(|index| {
            let segment = SegmentId(index as u8);
            let a = base.segment_status(segment);
            let b = diff.segment_status(segment);
            let totals_a = base.segment_totals().get(index).copied().unwrap_or_default();
            let totals_b = diff.segment_totals().get(index).copied().unwrap_or_default();
            let count = |status: &Option<super::SegmentStatus>| {
                status.as_ref().map_or((0, 0), |s| (s.allocation_count, s.resource_count))
            };
            let (allocations_a, resources_a) = count(&a);
            let (allocations_b, resources_b) = count(&b);
            SegmentDelta {
                segment,
                kind: b.as_ref().or(a.as_ref()).map(|s| s.kind),
                allocation_count: signed(allocations_a, allocations_b),
                resource_count: signed(resources_a, resources_b),
                bound: signed(totals_a.bound, totals_b.bound),
                unbound: signed(totals_a.unbound, totals_b.unbound),
                committed: signed(totals_a.committed, totals_b.committed),
            }
        })
        .collect();

    let ids_a: BTreeSet<Handle> = base.resources().map(|(_, r)| r.id).collect();
    let ids_b: BTreeSet<Handle> = diff.resources().map(|(_, r)| r.id).collect();
    let mut delta = SnapshotDelta {
        base_timestamp: base.timestamp(),
        diff_timestamp: diff.timestamp(),
        segments,
        ..SnapshotDelta::default()
    };
    for &id in &ids_a {
        if ids_b.contains(&id) {
            delta.common.push(id);
        } else {
            delta.only_in_base.push(id);
        }
    }
    delta.only_in_diff = ids_b.difference(&ids_a).copied().collect();

    let allocs_a = allocations(base);
    let allocs_b = allocations(diff);
    delta.allocations_removed = allocs_a
        .iter()
        .filter(|(key, _)| !allocs_b.contains_key(key))
        .map(|(_, a)| *a)
        .collect();
    delta.allocations_added = allocs_b
        .iter()
        .filter(|(key, _)| !allocs_a.contains_key(key))
        .map(|(_, a)| *a)
        .collect();
    delta
}
