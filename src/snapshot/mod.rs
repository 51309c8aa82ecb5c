//! Point-in-time views of the live state.
//!
//! A [`Snapshot`] freezes a [`LiveState`] behind an `Arc` and carries the
//! views derived from it. Nothing in a snapshot changes after construction,
//! so it can be shared across threads freely.

pub mod aliasing;
pub mod compare;
pub mod derive;
pub mod image;

pub use aliasing::{AliasComponent, AliasingPartition, AliasingTimeline, Footprint, TimelineBucket};
pub use compare::{compare, AllocationRef, SegmentDelta, SnapshotDelta};
pub use derive::{Backing, Derived, ResolvedRange, ResourceResolution, SegmentTotals, UsageTotals};
pub use image::{ImageSection, SnapshotImage, IMAGE_SCHEMA_VERSION};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::format::{SegmentTable, SnapshotInfo};
use crate::jobs::JobPool;
use crate::state::{
    LiveState, PhysicalAllocation, PhysicalIdx, Resource, ResourceIdx, VirtualAllocation,
    VirtualIdx,
};
use crate::types::{
    Address, Handle, ProcessId, ResourceUsage, SegmentId, SegmentKind, Timestamp, PAGE_SIZE,
};
use crate::Result;

/// Share of a segment's size above which requests count as close to the limit.
const CLOSE_TO_LIMIT: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Subscription {
    Under,
    CloseToLimit,
    Over,
}

/// Occupancy summary of one segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentStatus {
    pub segment: SegmentId,
    pub kind: SegmentKind,
    pub physical_size: u64,
    /// Virtual bytes of allocations preferring this segment's kind.
    pub requested_virtual: u64,
    /// Bytes of those allocations covered by bound resources.
    pub bound_virtual: u64,
    pub mapped_by_process: BTreeMap<ProcessId, u64>,
    pub allocation_count: u64,
    pub min_allocation: u64,
    pub max_allocation: u64,
    pub mean_allocation: f64,
    pub resource_count: u64,
    pub committed: u64,
    /// Backed bytes per usage class, indexed by [`ResourceUsage::index`].
    pub usage_physical: [u64; ResourceUsage::COUNT],
    pub subscription: Subscription,
}

pub struct Snapshot {
    name: String,
    timestamp: Timestamp,
    state: Arc<LiveState>,
    segments: Arc<SegmentTable>,
    derived: Derived,
}

impl Snapshot {
    /// Freezes `state` at `timestamp` and derives its views on `pool`.
    pub fn freeze(
        name: impl Into<String>,
        timestamp: Timestamp,
        state: LiveState,
        segments: Arc<SegmentTable>,
        pool: &JobPool,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let state = Arc::new(state);
        let derived = derive::derive(&state, &segments, pool, cancel)?;
        Ok(Self {
            name: name.into(),
            timestamp,
            state,
            segments,
            derived,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn state(&self) -> &LiveState {
        &self.state
    }

    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    pub fn derived(&self) -> &Derived {
        &self.derived
    }

    pub fn virtual_allocations(&self) -> impl Iterator<Item = (VirtualIdx, &VirtualAllocation)> {
        self.state.virtual_allocs.live()
    }

    pub fn physical_allocations(
        &self,
    ) -> impl Iterator<Item = (PhysicalIdx, &PhysicalAllocation)> {
        self.state.physical_allocs.live()
    }

    pub fn resources(&self) -> impl Iterator<Item = (ResourceIdx, &Resource)> {
        self.state.resources.live()
    }

    /// Live virtual allocations of `min..=max` bytes, smallest first.
    pub fn virtual_allocations_sized(
        &self,
        min: u64,
        max: u64,
    ) -> Vec<(VirtualIdx, &VirtualAllocation)> {
        let list = &self.state.virtual_allocs;
        list.allocations_in_size_range(min, max)
            .into_iter()
            .filter_map(|idx| list.get(idx).map(|allocation| (idx, allocation)))
            .collect()
    }

    /// Live physical allocations of `min..=max` bytes, smallest first.
    pub fn physical_allocations_sized(
        &self,
        min: u64,
        max: u64,
    ) -> Vec<(PhysicalIdx, &PhysicalAllocation)> {
        let list = &self.state.physical_allocs;
        list.allocations_in_size_range(min, max)
            .into_iter()
            .filter_map(|idx| list.get(idx).map(|allocation| (idx, allocation)))
            .collect()
    }

    /// Live resource known by `id`, canonical or alias.
    pub fn resource(&self, id: Handle) -> Option<(ResourceIdx, &Resource)> {
        let idx = self.state.resources.find(id)?;
        let resource = self.state.resources.get(idx)?;
        resource.is_live().then_some((idx, resource))
    }

    pub fn resolution(&self, resource: ResourceIdx) -> Option<&ResourceResolution> {
        self.derived
            .resolutions
            .binary_search_by_key(&resource, |r| r.resource)
            .ok()
            .and_then(|index| self.derived.resolutions.get(index))
    }

    /// Resolves an arbitrary virtual range of `process`.
    pub fn resolve_range(&self, process: ProcessId, address: Address, size: u64) -> Vec<ResolvedRange> {
        derive::resolve_range(&self.state.page_table, process, address, size)
    }

    pub fn segment_totals(&self) -> &[SegmentTotals] {
        &self.derived.segment_totals
    }

    pub fn usage_totals(&self) -> &[UsageTotals] {
        &self.derived.usage_totals
    }

    pub fn aliasing(&self) -> &AliasingPartition {
        &self.derived.aliasing
    }

    pub fn segment_status(&self, segment: SegmentId) -> Option<SegmentStatus> {
        let info = self.segments.get(segment)?;
        let totals = self.derived.segment_totals.get(segment.index());

        let mut requested_virtual = 0;
        let mut bound_virtual = 0;
        let mut allocation_count = 0;
        let mut min_allocation = u64::MAX;
        let mut max_allocation = 0;
        let mut resource_count = 0;
        for (_, allocation) in self.virtual_allocations() {
            if allocation.preferred_heap() != Some(info.kind) {
                continue;
            }
            let size = allocation.size_bytes();
            requested_virtual += size;
            allocation_count += 1;
            min_allocation = min_allocation.min(size);
            max_allocation = max_allocation.max(size);
            for resource in allocation
                .resources
                .iter()
                .filter_map(|&idx| self.state.resources.get(idx))
                .filter(|r| r.is_live())
            {
                resource_count += 1;
                bound_virtual += resource.size;
            }
        }
        if allocation_count == 0 {
            min_allocation = 0;
        }

        let mut mapped_by_process = BTreeMap::new();
        for process in self.state.page_table.processes() {
            let bytes: u64 = self
                .state
                .page_table
                .runs(process)
                .filter(|run| run.segment == segment && run.target.is_backed())
                .map(|run| run.length * PAGE_SIZE)
                .sum();
            if bytes > 0 {
                mapped_by_process.insert(process, bytes);
            }
        }

        let mut usage_physical = [0u64; ResourceUsage::COUNT];
        for resolution in &self.derived.resolutions {
            let Some(resource) = self.state.resources.get(resolution.resource) else {
                continue;
            };
            usage_physical[resource.usage.index()] += resolution
                .ranges
                .iter()
                .filter(|range| range.backing.segment() == Some(segment))
                .map(|range| range.length)
                .sum::<u64>();
        }
        usage_physical[ResourceUsage::FreeSpace.index()] = totals.map_or(0, |t| t.unbound);

        let subscription = if requested_virtual > info.size {
            Subscription::Over
        } else if requested_virtual as f64 > info.size as f64 * CLOSE_TO_LIMIT {
            Subscription::CloseToLimit
        } else {
            Subscription::Under
        };

        Some(SegmentStatus {
            segment,
            kind: info.kind,
            physical_size: info.size,
            requested_virtual,
            bound_virtual,
            mapped_by_process,
            allocation_count,
            min_allocation,
            max_allocation,
            mean_allocation: if allocation_count == 0 {
                0.0
            } else {
                requested_virtual as f64 / allocation_count as f64
            },
            resource_count,
            committed: totals.map_or(0, |t| t.committed),
            usage_physical,
            subscription,
        })
    }

    pub fn image(&self) -> SnapshotImage {
        SnapshotImage::capture(&self.name, self.timestamp, &self.state, &self.segments)
    }

    /// blake3 over the canonical image encoding.
    pub fn digest(&self) -> [u8; 32] {
        self.image().digest()
    }

    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            name: self.name.clone(),
            timestamp: self.timestamp,
            virtual_allocations: self.state.virtual_allocs.live_count() as u64,
            physical_allocations: self.state.physical_allocs.live_count() as u64,
            resources: self.state.resources.live_count() as u64,
            digest: self.digest(),
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("name", &self.name)
            .field("timestamp", &self.timestamp)
            .field("resources", &self.state.resources.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn snapshot_is_shareable() {
        assert_send_sync::<Snapshot>();
    }
}
