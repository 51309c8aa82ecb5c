//! Live memory state reconstructed from the event stream.
//!
//! [`LiveState`] owns every pool. Records refer to each other through the
//! index newtypes below, never through pointers, and each pool stores its
//! records behind `Arc` so cloning a state for a checkpoint is cheap and
//! later writes copy only the records they touch.

pub mod page_table;
pub mod physical_list;
pub mod process_map;
pub mod resources;
pub mod userdata;
pub mod virtual_list;

use std::sync::Arc;

use log::{debug, trace};
use serde::Serialize;

use crate::config::DuplicateResourcePolicy;
use crate::format::token::{
    MemoryEvent, PageTableUpdate, PageTarget, ProcessEventKind, ResourceBind, Token, UserData,
};
use crate::format::SegmentTable;
use crate::strings::StringPool;
use crate::types::{
    address_to_page, Address, MiscKind, ProcessId, Residency, SegmentId, Timestamp,
};
use crate::{Error, Result};

pub use page_table::{MappedTarget, PageRun, PageTable};
pub use physical_list::{PhysicalAllocation, PhysicalAllocationList};
pub use process_map::{Process, ProcessMap};
pub use resources::{CreateOutcome, Resource, ResourceList, IMPLICIT_ID_BASE};
pub use userdata::UserDataState;
pub use virtual_list::{VirtualAllocation, VirtualAllocationList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VirtualIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PhysicalIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceIdx(pub u32);

impl VirtualIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl PhysicalIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ResourceIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Inputs shared by every event application of one build.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    pub segments: &'a SegmentTable,
    pub policy: DuplicateResourcePolicy,
}

/// Counters accumulated while applying events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub events: u64,
    /// Events naming a resource, allocation or mapping the state does not know.
    pub orphan_events: u64,
    pub ignored_creates: u64,
    pub implicit_resources: u64,
    pub page_table_updates: u64,
    pub snapshot_markers: u64,
    pub binary_payloads: u64,
    /// Destroyed records dropped from the live pools at checkpoints.
    pub compacted_records: u64,
}

/// What applying one event changed, for callers that follow individual records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Nothing,
    Orphan,
    VirtualAllocated(VirtualIdx),
    VirtualFreed {
        allocation: VirtualIdx,
        unbound: Vec<ResourceIdx>,
    },
    PhysicalAllocated(PhysicalIdx),
    PhysicalFreed(PhysicalIdx),
    PageTable,
    Created(ResourceIdx),
    Merged(ResourceIdx),
    Destroyed(ResourceIdx),
    Bound {
        resource: ResourceIdx,
        previous: Option<VirtualIdx>,
        allocation: Option<VirtualIdx>,
    },
    CpuMapped(VirtualIdx),
    CpuUnmapped(VirtualIdx),
    Named(ResourceIdx),
    Correlated(ResourceIdx),
    Implicit(ResourceIdx),
    Residency(VirtualIdx),
    SnapshotMarker(Arc<str>),
}

/// The complete memory state after a prefix of the event stream.
#[derive(Debug, Clone, Default)]
pub struct LiveState {
    pub virtual_allocs: VirtualAllocationList,
    pub physical_allocs: PhysicalAllocationList,
    pub resources: ResourceList,
    pub user_data: UserDataState,
    pub page_table: PageTable,
    pub processes: ProcessMap,
    pub strings: StringPool,
    pub misc_counts: [u64; MiscKind::COUNT],
    pub stats: BuildStats,
    /// Timestamp of the last applied event.
    pub timestamp: Timestamp,
    /// Number of events applied.
    pub ordinal: u64,
    /// Bumped whenever resource footprints may have changed.
    pub alias_epoch: u64,
}

impl LiveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event. Events earlier than the last applied one are rejected.
    pub fn apply(&mut self, event: &MemoryEvent, ctx: &ApplyContext<'_>) -> Result<Applied> {
        if event.timestamp < self.timestamp {
            return Err(Error::TimestampRegress {
                stream: event.stream,
                previous: self.timestamp,
                timestamp: event.timestamp,
            });
        }
        let t = event.timestamp;
        let applied = match &event.token {
            Token::TimeDelta { .. } => Applied::Nothing,
            Token::ProcessEvent {
                process,
                event: kind,
                name,
            } => {
                match kind {
                    ProcessEventKind::Start => {
                        let name = self.strings.intern(name);
                        self.processes.start(*process, name, t);
                    }
                    ProcessEventKind::Stop => self.processes.stop(*process, t),
                }
                Applied::Nothing
            }
            Token::PageTableUpdate(update) => self.page_table_update(update, ctx, t)?,
            Token::UserData(data) => self.user_data(data, t)?,
            Token::Misc(kind) => {
                self.misc_counts[kind.as_u8() as usize] += 1;
                if *kind == MiscKind::TrimMemory {
                    for idx in self.virtual_allocs.live_indices() {
                        if let Some(allocation) = self.virtual_allocs.get_mut(idx) {
                            allocation.residency = Residency::Evicted;
                        }
                    }
                }
                Applied::Nothing
            }
            Token::ResourceCreate(create) => {
                match self.resources.create(create, t, ctx.policy)? {
                    CreateOutcome::Created(idx) => {
                        self.user_data.bind_pending(idx, &mut self.resources);
                        Applied::Created(idx)
                    }
                    CreateOutcome::Merged(idx) => {
                        self.user_data.bind_pending(idx, &mut self.resources);
                        Applied::Merged(idx)
                    }
                    CreateOutcome::Ignored(_) => {
                        self.stats.ignored_creates += 1;
                        Applied::Nothing
                    }
                }
            }
            Token::ResourceDestroy { id } => match self.resources.destroy(*id, t) {
                Some(idx) => {
                    let allocation = self.resources.get(idx).and_then(|r| r.allocation);
                    if let Some(owner) = allocation.and_then(|a| self.virtual_allocs.get_mut(a)) {
                        owner.resources.remove(&idx);
                        self.alias_epoch += 1;
                    }
                    Applied::Destroyed(idx)
                }
                None => self.orphan(event, "destroy of unknown resource"),
            },
            Token::ResourceBind(bind) => self.bind(bind, event, t),
            Token::VirtualFree { process, address } => {
                match self.virtual_allocs.destroy(*process, *address, t) {
                    Some(idx) => {
                        let unbound: Vec<ResourceIdx> = self
                            .virtual_allocs
                            .get(idx)
                            .map(|a| a.resources.iter().copied().collect())
                            .unwrap_or_default();
                        for &resource in &unbound {
                            if let Some(resource) = self.resources.get_mut(resource) {
                                resource.allocation = None;
                            }
                        }
                        if let Some(allocation) = self.virtual_allocs.get_mut(idx) {
                            allocation.resources.clear();
                        }
                        let process = self.processes.touch(*process, t);
                        process.virtual_allocations = process.virtual_allocations.saturating_sub(1);
                        if !unbound.is_empty() {
                            self.alias_epoch += 1;
                        }
                        Applied::VirtualFreed {
                            allocation: idx,
                            unbound,
                        }
                    }
                    None => self.orphan(event, "free of unknown virtual allocation"),
                }
            }
            Token::CpuMap { process, address } => {
                match self.containing(*process, *address) {
                    Some(idx) => {
                        if let Some(allocation) = self.virtual_allocs.get_mut(idx) {
                            allocation.cpu_map_count = allocation.cpu_map_count.saturating_add(1);
                        }
                        Applied::CpuMapped(idx)
                    }
                    None => self.orphan(event, "cpu map of unknown allocation"),
                }
            }
            Token::CpuUnmap { process, address } => {
                match self.containing(*process, *address) {
                    Some(idx) => {
                        if let Some(allocation) = self.virtual_allocs.get_mut(idx) {
                            allocation.cpu_map_count = allocation.cpu_map_count.saturating_sub(1);
                        }
                        Applied::CpuUnmapped(idx)
                    }
                    None => self.orphan(event, "cpu unmap of unknown allocation"),
                }
            }
            Token::VirtualAllocate(alloc) => {
                let mut allocation = VirtualAllocation::new(
                    alloc.handle,
                    alloc.process,
                    alloc.address,
                    alloc.size,
                    t,
                );
                allocation.preferred_heaps = alloc.preferred_heaps;
                allocation.owner = alloc.owner;
                allocation.external = alloc.external;
                let idx = self.virtual_allocs.insert(allocation)?;
                self.processes.touch(alloc.process, t).virtual_allocations += 1;
                Applied::VirtualAllocated(idx)
            }
            Token::PhysicalAllocate(alloc) => {
                let segment = ctx.segments.segment_for_address(alloc.address);
                let idx = self.physical_allocs.insert(PhysicalAllocation::new(
                    alloc.handle,
                    alloc.address,
                    alloc.size,
                    segment,
                    t,
                ))?;
                Applied::PhysicalAllocated(idx)
            }
            Token::PhysicalFree { address } => {
                let segment = ctx.segments.segment_for_address(*address);
                match self.physical_allocs.destroy(segment, *address, t) {
                    Some(idx) => Applied::PhysicalFreed(idx),
                    None => self.orphan(event, "free of unknown physical allocation"),
                }
            }
            Token::SnapshotMarker { name } => {
                self.stats.snapshot_markers += 1;
                Applied::SnapshotMarker(self.strings.intern(name))
            }
        };
        self.timestamp = t;
        self.ordinal += 1;
        self.stats.events += 1;
        Ok(applied)
    }

    fn orphan(&mut self, event: &MemoryEvent, what: &str) -> Applied {
        debug!(
            "{what} at t={} (stream {} offset {})",
            event.timestamp, event.stream, event.offset
        );
        self.stats.orphan_events += 1;
        Applied::Orphan
    }

    fn containing(&self, process: ProcessId, address: Address) -> Option<VirtualIdx> {
        self.virtual_allocs.find_containing(process, address)
    }

    fn page_table_update(
        &mut self,
        update: &PageTableUpdate,
        ctx: &ApplyContext<'_>,
        t: Timestamp,
    ) -> Result<Applied> {
        let virtual_page = address_to_page(update.virtual_address);
        let length = update.small_pages();
        if update.unmap {
            self.page_table.unmap(update.process, virtual_page, length)?;
        } else {
            let (target, segment) = match update.target {
                PageTarget::Physical if update.physical_address == 0 => (
                    MappedTarget::Host,
                    ctx.segments.segment_for_address(0),
                ),
                PageTarget::Physical => (
                    MappedTarget::Physical(update.physical_address),
                    ctx.segments.segment_for_address(update.physical_address),
                ),
                PageTarget::Invalid => (MappedTarget::Invalid, SegmentId::UNKNOWN),
                PageTarget::SystemReserved => (MappedTarget::SystemReserved, SegmentId::UNKNOWN),
            };
            self.page_table
                .map(update.process, virtual_page, target, length, segment, t)?;
        }
        trace!(
            "page table {} pid={} va={:#x} pages={}",
            if update.unmap { "unmap" } else { "map" },
            update.process,
            update.virtual_address,
            length
        );
        let committed = self.page_table.mapped_bytes(update.process)?;
        self.processes.set_committed(update.process, committed, t);
        self.stats.page_table_updates += 1;
        self.alias_epoch += 1;
        Ok(Applied::PageTable)
    }

    fn user_data(&mut self, data: &UserData, t: Timestamp) -> Result<Applied> {
        let applied = match data {
            UserData::DebugName { correlation, name } => match self.user_data.debug_name(
                *correlation,
                name,
                &mut self.resources,
                &mut self.strings,
            ) {
                Some(idx) => Applied::Named(idx),
                None => Applied::Nothing,
            },
            UserData::Correlation {
                correlation,
                resource_id,
            } => match self
                .user_data
                .correlate(*correlation, *resource_id, &mut self.resources)
            {
                Some(idx) => Applied::Correlated(idx),
                None => Applied::Nothing,
            },
            UserData::ImplicitResource {
                original_id,
                resource_type,
            } => {
                let idx = self
                    .resources
                    .create_implicit(*original_id, *resource_type, t)?;
                self.user_data.bind_pending(idx, &mut self.resources);
                self.stats.implicit_resources += 1;
                Applied::Implicit(idx)
            }
            UserData::Binary(_) => {
                self.stats.binary_payloads += 1;
                Applied::Nothing
            }
            UserData::ResidencyHint {
                process,
                address,
                resident,
            } => match self.containing(*process, *address) {
                Some(idx) => {
                    if let Some(allocation) = self.virtual_allocs.get_mut(idx) {
                        allocation.residency = if *resident {
                            Residency::Resident
                        } else {
                            Residency::Evicted
                        };
                    }
                    Applied::Residency(idx)
                }
                None => {
                    self.stats.orphan_events += 1;
                    Applied::Orphan
                }
            },
        };
        Ok(applied)
    }

    fn bind(&mut self, bind: &ResourceBind, event: &MemoryEvent, t: Timestamp) -> Applied {
        let Some(resource) = self.resources.find(bind.id) else {
            return self.orphan(event, "bind of unknown resource");
        };
        let allocation = self.containing(bind.process, bind.virtual_address);
        let base = allocation
            .and_then(|idx| self.virtual_allocs.get(idx))
            .map_or(bind.virtual_address, |a| a.base);
        let previous = self.resources.get(resource).and_then(|r| r.allocation);
        if let Some(old) = previous.and_then(|idx| self.virtual_allocs.get_mut(idx)) {
            old.resources.remove(&resource);
        }
        if let Some(record) = self.resources.get_mut(resource) {
            record.process = bind.process;
            record.virtual_address = bind.virtual_address;
            record.offset = bind.virtual_address - base;
            if bind.size != 0 {
                record.size = bind.size;
            }
            record.system_memory = bind.system_memory;
            record.allocation = allocation;
            record.bound_at = Some(t);
        }
        if let Some(owner) = allocation.and_then(|idx| self.virtual_allocs.get_mut(idx)) {
            owner.resources.insert(resource);
        }
        self.alias_epoch += 1;
        Applied::Bound {
            resource,
            previous,
            allocation,
        }
    }

    /// Drops records destroyed before `before` from every pool. Dropped
    /// resources move to `retired` so their history stays reachable.
    pub fn compact(
        &mut self,
        before: Timestamp,
        retired: &mut Vec<(ResourceIdx, Arc<Resource>)>,
    ) -> Result<usize> {
        let dropped = self.virtual_allocs.compact(before)
            + self.physical_allocs.compact(before)
            + self.resources.compact(before, retired)?;
        self.stats.compacted_records += dropped as u64;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::token::{ResourceCreate, ResourceDescription, VirtualAllocate};
    use crate::format::SegmentInfo;
    use crate::types::{
        CommitType, OwnerType, PageSize, SegmentKind, HEAP_PREFERENCE_COUNT, PAGE_SIZE,
    };

    fn segments() -> SegmentTable {
        SegmentTable::new(vec![
            SegmentInfo {
                base_address: 0x8000_0000,
                size: 0x1000_0000,
                kind: SegmentKind::Local,
                memory_index: 0,
            },
            SegmentInfo {
                base_address: 0x1_0000_0000,
                size: 0x1000_0000,
                kind: SegmentKind::HostVisible,
                memory_index: 1,
            },
        ])
        .unwrap()
    }

    fn event(timestamp: Timestamp, token: Token) -> MemoryEvent {
        MemoryEvent {
            timestamp,
            thread: 0,
            stream: 0,
            offset: 0,
            token,
        }
    }

    fn valloc(handle: u64, address: Address, pages: u64) -> Token {
        Token::VirtualAllocate(VirtualAllocate {
            process: 1,
            handle,
            address,
            size: pages * PAGE_SIZE,
            preferred_heaps: [Some(SegmentKind::Local); HEAP_PREFERENCE_COUNT],
            owner: OwnerType::Application,
            external: false,
        })
    }

    fn map(address: Address, physical: Address, pages: u64) -> Token {
        Token::PageTableUpdate(PageTableUpdate {
            process: 1,
            virtual_address: address,
            physical_address: physical,
            page_count: pages,
            page_size: PageSize::Size4K,
            unmap: false,
            target: PageTarget::Physical,
        })
    }

    fn create(id: u64) -> Token {
        Token::ResourceCreate(ResourceCreate {
            id,
            correlation: 0,
            owner: OwnerType::Application,
            commit: CommitType::Placed,
            description: ResourceDescription::Buffer {
                size: PAGE_SIZE,
                usage_flags: 0,
                create_flags: 0,
            },
        })
    }

    fn bind(id: u64, address: Address) -> Token {
        Token::ResourceBind(ResourceBind {
            process: 1,
            id,
            virtual_address: address,
            size: PAGE_SIZE,
            system_memory: false,
        })
    }

    #[test]
    fn bind_then_free_unbinds_resource() -> Result<()> {
        let table = segments();
        let ctx = ApplyContext {
            segments: &table,
            policy: DuplicateResourcePolicy::KeepFirst,
        };
        let mut state = LiveState::new();
        state.apply(&event(1, valloc(1, 0x10000, 4)), &ctx)?;
        let Applied::Created(resource) = state.apply(&event(2, create(7)), &ctx)? else {
            panic!("resource not created");
        };
        state.apply(&event(3, bind(7, 0x11000)), &ctx)?;
        let record = state.resources.get(resource).unwrap();
        assert_eq!(record.offset, 0x1000);
        assert!(record.is_bound());

        let applied = state.apply(
            &event(
                4,
                Token::VirtualFree {
                    process: 1,
                    address: 0x10000,
                },
            ),
            &ctx,
        )?;
        assert!(matches!(applied, Applied::VirtualFreed { ref unbound, .. } if unbound == &[resource]));
        assert!(!state.resources.get(resource).unwrap().is_bound());
        Ok(())
    }

    #[test]
    fn earlier_event_is_rejected() -> Result<()> {
        let table = segments();
        let ctx = ApplyContext {
            segments: &table,
            policy: DuplicateResourcePolicy::KeepFirst,
        };
        let mut state = LiveState::new();
        state.apply(&event(10, valloc(1, 0x10000, 1)), &ctx)?;
        state.apply(&event(10, Token::Misc(MiscKind::Present)), &ctx)?;
        assert!(matches!(
            state.apply(&event(9, Token::Misc(MiscKind::Present)), &ctx),
            Err(Error::TimestampRegress {
                previous: 10,
                timestamp: 9,
                ..
            })
        ));
        assert_eq!(state.misc_counts[MiscKind::Present.as_u8() as usize], 1);
        Ok(())
    }

    #[test]
    fn physical_zero_maps_host_memory() -> Result<()> {
        let table = segments();
        let ctx = ApplyContext {
            segments: &table,
            policy: DuplicateResourcePolicy::KeepFirst,
        };
        let mut state = LiveState::new();
        state.apply(&event(1, map(0x10000, 0, 2)), &ctx)?;
        assert_eq!(
            state.page_table.resolve(1, 0x11),
            Some((MappedTarget::Host, SegmentId(1)))
        );
        assert_eq!(state.processes.get(1).unwrap().committed_bytes, 2 * PAGE_SIZE);
        Ok(())
    }

    #[test]
    fn unknown_targets_are_counted_not_fatal() -> Result<()> {
        let table = segments();
        let ctx = ApplyContext {
            segments: &table,
            policy: DuplicateResourcePolicy::KeepFirst,
        };
        let mut state = LiveState::new();
        assert_eq!(state.apply(&event(1, bind(99, 0x1000)), &ctx)?, Applied::Orphan);
        assert_eq!(
            state.apply(&event(2, Token::ResourceDestroy { id: 99 }), &ctx)?,
            Applied::Orphan
        );
        assert_eq!(state.stats.orphan_events, 2);
        Ok(())
    }

    #[test]
    fn trim_memory_evicts_every_allocation() -> Result<()> {
        let table = segments();
        let ctx = ApplyContext {
            segments: &table,
            policy: DuplicateResourcePolicy::KeepFirst,
        };
        let mut state = LiveState::new();
        state.apply(&event(1, valloc(1, 0x10000, 1)), &ctx)?;
        state.apply(&event(2, valloc(2, 0x20000, 1)), &ctx)?;
        let snapshot = state.clone();
        state.apply(&event(3, Token::Misc(MiscKind::TrimMemory)), &ctx)?;
        assert!(state
            .virtual_allocs
            .live()
            .all(|(_, a)| a.residency == Residency::Evicted));
        assert!(snapshot
            .virtual_allocs
            .live()
            .all(|(_, a)| a.residency == Residency::Resident));
        Ok(())
    }
}
