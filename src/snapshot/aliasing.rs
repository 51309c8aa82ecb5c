//! Aliasing partition: resources whose physical footprints overlap.
//!
//! Footprints are swept per segment in `(start, end)` order with an active set
//! keyed by physical end. Every footprint still active when a new one starts
//! overlaps it, so the two land in one component.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::jobs::JobPool;
use crate::state::ResourceIdx;
use crate::types::{Address, Handle, SegmentId, SegmentKind, Timestamp};
use crate::Result;

/// Physical bytes one resource occupies in one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Footprint {
    pub segment: SegmentId,
    pub start: Address,
    pub end: Address,
    pub resource: ResourceIdx,
}

/// Result of sweeping one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentSweep {
    /// Groups of resources connected by overlaps, each sorted.
    pub groups: Vec<Vec<ResourceIdx>>,
    /// Bytes covered by two or more footprints.
    pub aliased_bytes: u64,
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        match self.rank[a].cmp(&self.rank[b]) {
            std::cmp::Ordering::Less => self.parent[a] = b,
            std::cmp::Ordering::Greater => self.parent[b] = a,
            std::cmp::Ordering::Equal => {
                self.parent[b] = a;
                self.rank[a] += 1;
            }
        }
    }
}

/// Sweeps footprints of a single segment.
pub fn sweep_segment(mut footprints: Vec<Footprint>) -> SegmentSweep {
    footprints.retain(|fp| fp.end > fp.start);
    footprints.sort_unstable();

    let mut resources: Vec<ResourceIdx> = footprints.iter().map(|fp| fp.resource).collect();
    resources.sort_unstable();
    resources.dedup();
    let slot = |resource: ResourceIdx| resources.binary_search(&resource).unwrap_or(0);

    let mut sets = UnionFind::new(resources.len());
    let mut active: BTreeMap<(Address, usize), usize> = BTreeMap::new();
    let mut aliased_bytes = 0u64;
    let mut covered_to = 0u64;
    let mut max_end = 0u64;

    for (index, fp) in footprints.iter().enumerate() {
        while let Some(entry) = active.first_entry() {
            if entry.key().0 > fp.start {
                break;
            }
            entry.remove();
        }
        for &other in active.values() {
            sets.union(slot(fp.resource), slot(footprints[other].resource));
        }
        // Bytes inside both this footprint and the furthest earlier one.
        let overlap_end = fp.end.min(max_end);
        let overlap_start = fp.start.max(covered_to);
        if overlap_end > overlap_start {
            aliased_bytes += overlap_end - overlap_start;
            covered_to = overlap_end;
        }
        max_end = max_end.max(fp.end);
        active.insert((fp.end, index), index);
    }

    let mut groups: BTreeMap<usize, Vec<ResourceIdx>> = BTreeMap::new();
    for (index, &resource) in resources.iter().enumerate() {
        let root = sets.find(index);
        groups.entry(root).or_default().push(resource);
    }
    let mut groups: Vec<Vec<ResourceIdx>> = groups.into_values().collect();
    groups.sort_unstable();
    SegmentSweep {
        groups,
        aliased_bytes,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AliasComponent {
    pub members: Vec<ResourceIdx>,
    /// Canonical identifiers of `members`, in the same order.
    pub ids: Vec<Handle>,
    pub segments: Vec<SegmentId>,
    pub min_address: Address,
    pub max_address: Address,
}

impl AliasComponent {
    pub fn is_aliased(&self) -> bool {
        self.members.len() > 1
    }
}

/// Equivalence classes over every resource with a physical footprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AliasingPartition {
    pub components: Vec<AliasComponent>,
    #[serde(skip)]
    component_of: BTreeMap<ResourceIdx, usize>,
    pub aliased_bytes: u64,
}

impl AliasingPartition {
    /// Whether `a` and `b` share a component. A resource with a footprint
    /// aliases itself.
    pub fn aliases(&self, a: ResourceIdx, b: ResourceIdx) -> bool {
        match (self.component_of.get(&a), self.component_of.get(&b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    pub fn component_of(&self, resource: ResourceIdx) -> Option<&AliasComponent> {
        self.component_of
            .get(&resource)
            .and_then(|&index| self.components.get(index))
    }

    pub fn aliased_components(&self) -> impl Iterator<Item = &AliasComponent> {
        self.components.iter().filter(|c| c.is_aliased())
    }

    pub fn aliased_resource_count(&self) -> usize {
        self.aliased_components().map(|c| c.members.len()).sum()
    }
}

/// Merges per-segment sweeps into one partition. A resource with footprints
/// in several segments joins their groups.
pub fn assemble(
    footprints: &[Footprint],
    sweeps: Vec<SegmentSweep>,
    id_of: impl Fn(ResourceIdx) -> Handle,
) -> AliasingPartition {
    let resources: Vec<ResourceIdx> = footprints
        .iter()
        .filter(|fp| fp.end > fp.start)
        .map(|fp| fp.resource)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let slot = |resource: ResourceIdx| resources.binary_search(&resource).ok();

    let mut sets = UnionFind::new(resources.len());
    let mut aliased_bytes = 0;
    for sweep in &sweeps {
        aliased_bytes += sweep.aliased_bytes;
        for group in &sweep.groups {
            let mut members = group.iter().filter_map(|&r| slot(r));
            if let Some(first) = members.next() {
                for other in members {
                    sets.union(first, other);
                }
            }
        }
    }

    let mut by_root: BTreeMap<usize, AliasComponent> = BTreeMap::new();
    for fp in footprints.iter().filter(|fp| fp.end > fp.start) {
        let Some(index) = slot(fp.resource) else {
            continue;
        };
        let root = sets.find(index);
        let component = by_root.entry(root).or_insert_with(|| AliasComponent {
            members: Vec::new(),
            ids: Vec::new(),
            segments: Vec::new(),
            min_address: fp.start,
            max_address: fp.end,
        });
        component.members.push(fp.resource);
        component.segments.push(fp.segment);
        component.min_address = component.min_address.min(fp.start);
        component.max_address = component.max_address.max(fp.end);
    }

    let mut components: Vec<AliasComponent> = by_root.into_values().collect();
    for component in &mut components {
        component.members.sort_unstable();
        component.members.dedup();
        component.segments.sort_unstable();
        component.segments.dedup();
        component.ids = component.members.iter().map(|&r| id_of(r)).collect();
    }
    components.sort_by(|a, b| a.members.cmp(&b.members));
    let component_of = components
        .iter()
        .enumerate()
        .flat_map(|(index, c)| c.members.iter().map(move |&r| (r, index)))
        .collect();
    AliasingPartition {
        components,
        component_of,
        aliased_bytes,
    }
}

/// Splits footprints by segment.
pub fn by_segment(footprints: &[Footprint]) -> Vec<Vec<Footprint>> {
    let mut segments: BTreeMap<SegmentId, Vec<Footprint>> = BTreeMap::new();
    for fp in footprints {
        segments.entry(fp.segment).or_default().push(*fp);
    }
    segments.into_values().collect()
}

/// Computes the partition with one sweep per segment on the pool.
pub fn partition(
    footprints: &[Footprint],
    pool: &JobPool,
    cancel: &CancelToken,
    id_of: impl Fn(ResourceIdx) -> Handle,
) -> Result<AliasingPartition> {
    let sweeps = pool.map(by_segment(footprints), sweep_segment, cancel)?;
    Ok(assemble(footprints, sweeps, id_of))
}

/// Computes the partition on the calling thread.
pub fn partition_serial(
    footprints: &[Footprint],
    id_of: impl Fn(ResourceIdx) -> Handle,
) -> AliasingPartition {
    let sweeps = by_segment(footprints).into_iter().map(sweep_segment).collect();
    assemble(footprints, sweeps, id_of)
}

/// One equal-duration slice of the aliasing timeline, measured at its end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineBucket {
    pub start: Timestamp,
    pub end: Timestamp,
    pub aliased_components: usize,
    pub aliased_resources: usize,
    pub aliased_bytes: u64,
    pub live_resources: usize,
    /// Committed bytes per segment kind, indexed by [`SegmentKind::as_u8`].
    pub committed_by_kind: [u64; SegmentKind::COUNT],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AliasingTimeline {
    pub buckets: Vec<TimelineBucket>,
}

impl AliasingTimeline {
    pub fn peak_aliased_bytes(&self) -> u64 {
        self.buckets
            .iter()
            .map(|bucket| bucket.aliased_bytes)
            .max()
            .unwrap_or(0)
    }
}
