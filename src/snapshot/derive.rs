//! Derived views of a frozen state: per-resource virtual-to-physical
//! resolution, per-segment and per-usage totals, aliasing footprints.

use std::sync::Arc;

use serde::Serialize;

use super::aliasing::{self, AliasingPartition, Footprint};
use crate::cancel::CancelToken;
use crate::format::SegmentTable;
use crate::jobs::JobPool;
use crate::state::{LiveState, MappedTarget, PageTable, ResourceIdx};
use crate::types::{
    address_to_page, Address, Handle, ProcessId, Residency, ResourceUsage, SegmentId, SegmentKind,
    PAGE_SIZE,
};
use crate::Result;

/// Resources resolved per pool job.
const RESOLVE_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Backing {
    Physical { segment: SegmentId, address: Address },
    Host { segment: SegmentId },
    Unmapped,
    Invalid,
    SystemReserved,
}

impl Backing {
    pub fn is_backed(&self) -> bool {
        matches!(self, Backing::Physical { .. } | Backing::Host { .. })
    }

    pub fn segment(&self) -> Option<SegmentId> {
        match *self {
            Backing::Physical { segment, .. } | Backing::Host { segment } => Some(segment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedRange {
    /// Offset from the start of the resolved virtual range.
    pub virtual_offset: u64,
    pub length: u64,
    pub backing: Backing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceResolution {
    pub resource: ResourceIdx,
    pub id: Handle,
    pub ranges: Vec<ResolvedRange>,
}

impl ResourceResolution {
    pub fn backed_bytes(&self) -> u64 {
        self.ranges
            .iter()
            .filter(|range| range.backing.is_backed())
            .map(|range| range.length)
            .sum()
    }

    pub fn footprints(&self) -> impl Iterator<Item = Footprint> + '_ {
        self.ranges.iter().filter_map(|range| match range.backing {
            Backing::Physical { segment, address } if segment.is_known() => Some(Footprint {
                segment,
                start: address,
                end: address.saturating_add(range.length),
                resource: self.resource,
            }),
            _ => None,
        })
    }
}

/// Walks `[address, address + size)` of `process` against the page table.
/// Gaps between runs come back as [`Backing::Unmapped`].
pub fn resolve_range(
    page_table: &PageTable,
    process: ProcessId,
    address: Address,
    size: u64,
) -> Vec<ResolvedRange> {
    let mut out = Vec::new();
    if size == 0 {
        return out;
    }
    let end = address.saturating_add(size);
    let first_page = address_to_page(address);
    let last_page = address_to_page(end.saturating_sub(1));
    let mut cursor = address;

    let push = |out: &mut Vec<ResolvedRange>, from: Address, to: Address, backing: Backing| {
        if to <= from {
            return;
        }
        let range = ResolvedRange {
            virtual_offset: from - address,
            length: to - from,
            backing,
        };
        match out.last_mut() {
            Some(last)
                if last.backing == Backing::Unmapped
                    && range.backing == Backing::Unmapped
                    && last.virtual_offset + last.length == range.virtual_offset =>
            {
                last.length += range.length;
            }
            _ => out.push(range),
        }
    };

    for run in page_table.runs_in(process, first_page, last_page - first_page + 1) {
        let run_start = run.virtual_page * PAGE_SIZE;
        let from = run_start.max(address);
        let to = (run.end() * PAGE_SIZE).min(end);
        push(&mut out, cursor, from, Backing::Unmapped);
        let backing = match run.target {
            MappedTarget::Physical(physical) => Backing::Physical {
                segment: run.segment,
                address: physical + (from - run_start),
            },
            MappedTarget::Host => Backing::Host {
                segment: run.segment,
            },
            MappedTarget::Invalid => Backing::Invalid,
            MappedTarget::SystemReserved => Backing::SystemReserved,
        };
        push(&mut out, from, to, backing);
        cursor = to;
    }
    push(&mut out, cursor, end, Backing::Unmapped);
    out
}

/// Resolution of each listed resource. Unbound resources resolve to nothing.
pub fn resolve_resources(state: &LiveState, resources: &[ResourceIdx]) -> Vec<ResourceResolution> {
    resources
        .iter()
        .filter_map(|&idx| {
            let resource = state.resources.get(idx)?;
            let ranges = if resource.is_bound() {
                resolve_range(
                    &state.page_table,
                    resource.process,
                    resource.virtual_address,
                    resource.size,
                )
            } else {
                Vec::new()
            };
            Some(ResourceResolution {
                resource: idx,
                id: resource.id,
                ranges,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SegmentTotals {
    pub segment: SegmentId,
    pub kind: Option<SegmentKind>,
    pub size: u64,
    /// Bytes mapped onto the segment by the page table.
    pub committed: u64,
    pub physical_allocated: u64,
    /// Backed bytes of bound resources.
    pub bound: u64,
    /// Backed bytes of virtual allocations not covered by any resource.
    pub unbound: u64,
    /// Backed bytes of allocations whose residency hint is resident.
    pub resident: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub usage: ResourceUsage,
    pub count: u64,
    pub virtual_bytes: u64,
    pub physical_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Derived {
    pub resolutions: Vec<ResourceResolution>,
    pub segment_totals: Vec<SegmentTotals>,
    pub usage_totals: Vec<UsageTotals>,
    pub aliasing: AliasingPartition,
}

/// Sorted, merged `[start, end)` intervals.
fn merge_intervals(mut intervals: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    intervals.retain(|(start, end)| end > start);
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn covered(intervals: &[(u64, u64)], start: u64, end: u64) -> u64 {
    intervals
        .iter()
        .map(|&(a, b)| b.min(end).saturating_sub(a.max(start)))
        .sum()
}

struct FreeSpace {
    virtual_bytes: u64,
    physical_bytes: u64,
    allocations: u64,
}

fn allocation_totals(
    state: &LiveState,
    segments: &SegmentTable,
    totals: &mut [SegmentTotals],
) -> FreeSpace {
    let mut free = FreeSpace {
        virtual_bytes: 0,
        physical_bytes: 0,
        allocations: 0,
    };
    for (_, allocation) in state.virtual_allocs.live() {
        let bound = merge_intervals(
            allocation
                .resources
                .iter()
                .filter_map(|&idx| state.resources.get(idx))
                .filter(|resource| resource.is_live())
                .map(|resource| {
                    (
                        resource.virtual_address.max(allocation.base),
                        resource.end_address().min(allocation.end()),
                    )
                })
                .collect(),
        );
        let unbound_virtual = allocation
            .size_bytes()
            .saturating_sub(covered(&bound, allocation.base, allocation.end()));
        if unbound_virtual > 0 {
            free.virtual_bytes += unbound_virtual;
            free.allocations += 1;
        }

        let runs = state.page_table.runs_in(
            allocation.process,
            address_to_page(allocation.base),
            allocation.size_pages,
        );
        for run in runs.iter().filter(|run| run.target.is_backed()) {
            let start = run.virtual_page * PAGE_SIZE;
            let end = run.end() * PAGE_SIZE;
            let unbound = (end - start).saturating_sub(covered(&bound, start, end));
            free.physical_bytes += unbound;
            if !run.segment.is_known() || run.segment.index() >= segments.len() {
                continue;
            }
            let slot = &mut totals[run.segment.index()];
            slot.unbound += unbound;
            if allocation.residency == Residency::Resident {
                slot.resident += end - start;
            }
        }
    }
    free
}

/// Aggregates and the aliasing partition over already resolved resources.
pub fn aggregate(
    state: &LiveState,
    segments: &SegmentTable,
    resolutions: Vec<ResourceResolution>,
    aliasing: AliasingPartition,
) -> Derived {
    let committed = state.page_table.mapped_bytes_per_segment();
    let mut segment_totals: Vec<SegmentTotals> = segments
        .iter()
        .map(|(segment, info)| SegmentTotals {
            segment,
            kind: Some(info.kind),
            size: info.size,
            committed: committed.get(segment.index()).copied().unwrap_or(0),
            ..SegmentTotals::default()
        })
        .collect();

    for (_, allocation) in state.physical_allocs.live() {
        if let Some(slot) = segment_totals.get_mut(allocation.segment.index()) {
            slot.physical_allocated += allocation.size_bytes();
        }
    }

    let mut usage_totals: Vec<UsageTotals> = ResourceUsage::ALL
        .iter()
        .map(|&usage| UsageTotals {
            usage,
            count: 0,
            virtual_bytes: 0,
            physical_bytes: 0,
        })
        .collect();

    for resolution in &resolutions {
        let Some(resource) = state.resources.get(resolution.resource) else {
            continue;
        };
        for range in &resolution.ranges {
            if let Some(slot) = range
                .backing
                .segment()
                .and_then(|segment| segment_totals.get_mut(segment.index()))
            {
                slot.bound += range.length;
            }
        }
        let totals = &mut usage_totals[resource.usage.index()];
        totals.count += 1;
        totals.virtual_bytes += resource.size;
        totals.physical_bytes += resolution.backed_bytes();
    }

    let free = allocation_totals(state, segments, &mut segment_totals);
    let free_totals = &mut usage_totals[ResourceUsage::FreeSpace.index()];
    free_totals.count = free.allocations;
    free_totals.virtual_bytes = free.virtual_bytes;
    free_totals.physical_bytes = free.physical_bytes;

    Derived {
        resolutions,
        segment_totals,
        usage_totals,
        aliasing,
    }
}

fn footprints(resolutions: &[ResourceResolution]) -> Vec<Footprint> {
    resolutions
        .iter()
        .flat_map(ResourceResolution::footprints)
        .collect()
}

/// Derives everything on the calling thread.
pub fn derive_serial(state: &LiveState, segments: &SegmentTable) -> Derived {
    let live = state.resources.live_indices();
    let resolutions = resolve_resources(state, &live);
    let aliasing = aliasing::partition_serial(&footprints(&resolutions), |idx| {
        state.resources.get(idx).map_or(0, |r| r.id)
    });
    aggregate(state, segments, resolutions, aliasing)
}

/// Derives with resolution chunks and per-segment sweeps on the pool.
/// Results are assembled in resource order, independent of scheduling.
pub fn derive(
    state: &Arc<LiveState>,
    segments: &SegmentTable,
    pool: &JobPool,
    cancel: &CancelToken,
) -> Result<Derived> {
    let live = state.resources.live_indices();
    let chunks: Vec<Vec<ResourceIdx>> = live.chunks(RESOLVE_CHUNK).map(<[_]>::to_vec).collect();
    let shared = Arc::clone(state);
    let resolved = pool.map(
        chunks,
        move |chunk| resolve_resources(&shared, &chunk),
        cancel,
    )?;
    let resolutions: Vec<ResourceResolution> = resolved.into_iter().flatten().collect();
    let aliasing = aliasing::partition(&footprints(&resolutions), pool, cancel, |idx| {
        state.resources.get(idx).map_or(0, |r| r.id)
    })?;
    Ok(aggregate(state, segments, resolutions, aliasing))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_range_splits_at_run_edges() {
        let mut table = PageTable::new();
        table
            .map(1, 0x10, MappedTarget::Physical(0x8000_0000), 2, SegmentId(0), 1)
            .unwrap();
        table
            .map(1, 0x13, MappedTarget::Invalid, 1, SegmentId::UNKNOWN, 1)
            .unwrap();
        let ranges = resolve_range(&table, 1, 0x10800, 0x3000);
        assert_eq!(
            ranges,
            vec![
                ResolvedRange {
                    virtual_offset: 0,
                    length: 0x1800,
                    backing: Backing::Physical {
                        segment: SegmentId(0),
                        address: 0x8000_0800
                    },
                },
                ResolvedRange {
                    virtual_offset: 0x1800,
                    length: 0x1000,
                    backing: Backing::Unmapped,
                },
                ResolvedRange {
                    virtual_offset: 0x2800,
                    length: 0x800,
                    backing: Backing::Invalid,
                },
            ]
        );
    }

    #[test]
    fn unmapped_range_is_one_gap() {
        let table = PageTable::new();
        let ranges = resolve_range(&table, 1, 0x4000, 0x2000);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].backing, Backing::Unmapped);
        assert_eq!(ranges[0].length, 0x2000);
    }

    #[test]
    fn intervals_merge_and_cover() {
        let merged = merge_intervals(vec![(10, 20), (15, 30), (40, 50), (50, 55)]);
        assert_eq!(merged, vec![(10, 30), (40, 55)]);
        assert_eq!(covered(&merged, 0, 100), 35);
        assert_eq!(covered(&merged, 25, 45), 10);
    }

    #[test]
    fn default_totals_name_no_segment() {
        let totals = SegmentTotals::default();
        assert_eq!(totals.segment, SegmentId::UNKNOWN);
        assert!(!totals.segment.is_known());
        assert_eq!(totals.committed, 0);
    }
}
