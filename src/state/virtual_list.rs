use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use super::{ResourceIdx, VirtualIdx};
use crate::types::{
    bytes_to_pages, Address, Handle, OwnerType, ProcessId, Residency, SegmentKind, Timestamp,
    HEAP_PREFERENCE_COUNT, PAGE_SIZE,
};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualAllocation {
    pub handle: Handle,
    pub process: ProcessId,
    pub base: Address,
    pub size_pages: u64,
    pub preferred_heaps: [Option<SegmentKind>; HEAP_PREFERENCE_COUNT],
    pub owner: OwnerType,
    pub created: Timestamp,
    pub destroyed: Option<Timestamp>,
    pub residency: Residency,
    pub external: bool,
    pub cpu_map_count: u32,
    pub resources: BTreeSet<ResourceIdx>,
}

impl VirtualAllocation {
    pub fn new(
        handle: Handle,
        process: ProcessId,
        base: Address,
        size_bytes: u64,
        created: Timestamp,
    ) -> Self {
        Self {
            handle,
            process,
            base,
            size_pages: bytes_to_pages(size_bytes),
            preferred_heaps: [None; HEAP_PREFERENCE_COUNT],
            owner: OwnerType::Application,
            created,
            destroyed: None,
            residency: Residency::Resident,
            external: false,
            cpu_map_count: 0,
            resources: BTreeSet::new(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_pages.saturating_mul(PAGE_SIZE)
    }

    pub fn end(&self) -> Address {
        self.base.saturating_add(self.size_bytes())
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.end()
    }

    pub fn is_live(&self) -> bool {
        self.destroyed.is_none()
    }

    pub fn host_mapped(&self) -> bool {
        self.cpu_map_count > 0
    }

    pub fn preferred_heap(&self) -> Option<SegmentKind> {
        self.preferred_heaps[0]
    }
}

/// Registry of virtual allocations.
///
/// Records live in slots and are never moved; a slot only empties when
/// [`VirtualAllocationList::compact`] drops a destroyed record. The slot
/// vector and every index sit behind `Arc`, so a clone shares them until
/// either side writes.
#[derive(Debug, Clone, Default)]
pub struct VirtualAllocationList {
    slots: Arc<Vec<Option<Arc<VirtualAllocation>>>>,
    by_base: Arc<BTreeMap<(ProcessId, Address), VirtualIdx>>,
    by_handle: Arc<HashMap<Handle, VirtualIdx>>,
    by_size: Arc<BTreeSet<(u64, VirtualIdx)>>,
    /// Destroyed records still holding a slot.
    retiring: Vec<VirtualIdx>,
}

impl VirtualAllocationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a live allocation. Fails when its handle or base is live or its
    /// range overlaps a live allocation of the same process.
    pub fn insert(&mut self, allocation: VirtualAllocation) -> Result<VirtualIdx> {
        let duplicate = Error::DuplicateAllocation {
            address: allocation.base,
        };
        if self.by_handle.contains_key(&allocation.handle) {
            return Err(duplicate);
        }
        let process = allocation.process;
        if let Some((_, &idx)) = self
            .by_base
            .range((process, 0)..=(process, allocation.base))
            .next_back()
        {
            if self.get(idx).is_some_and(|prev| prev.end() > allocation.base) {
                return Err(duplicate);
            }
        }
        if let Some((&(_, next_base), _)) = self
            .by_base
            .range((process, allocation.base)..(process, Address::MAX))
            .next()
        {
            if next_base < allocation.end() || next_base == allocation.base {
                return Err(duplicate);
            }
        }

        let slots = Arc::make_mut(&mut self.slots);
        slots.try_reserve(1)?;
        let idx = VirtualIdx(slots.len() as u32);
        Arc::make_mut(&mut self.by_base).insert((process, allocation.base), idx);
        Arc::make_mut(&mut self.by_handle).insert(allocation.handle, idx);
        Arc::make_mut(&mut self.by_size).insert((allocation.size_bytes(), idx));
        slots.push(Some(Arc::new(allocation)));
        Ok(idx)
    }

    /// Marks the live allocation at `base` destroyed and drops it from the live indices.
    pub fn destroy(
        &mut self,
        process: ProcessId,
        base: Address,
        timestamp: Timestamp,
    ) -> Option<VirtualIdx> {
        let idx = Arc::make_mut(&mut self.by_base).remove(&(process, base))?;
        let allocation = self.get_mut(idx)?;
        allocation.destroyed = Some(timestamp);
        let handle = allocation.handle;
        let size = allocation.size_bytes();
        Arc::make_mut(&mut self.by_handle).remove(&handle);
        Arc::make_mut(&mut self.by_size).remove(&(size, idx));
        self.retiring.push(idx);
        Some(idx)
    }

    pub fn get(&self, idx: VirtualIdx) -> Option<&VirtualAllocation> {
        self.slots.get(idx.index())?.as_deref()
    }

    /// Copy-on-write access to one record.
    pub fn get_mut(&mut self, idx: VirtualIdx) -> Option<&mut VirtualAllocation> {
        Arc::make_mut(&mut self.slots)
            .get_mut(idx.index())?
            .as_mut()
            .map(Arc::make_mut)
    }

    pub fn find_by_handle(&self, handle: Handle) -> Option<VirtualIdx> {
        self.by_handle.get(&handle).copied()
    }

    pub fn find_by_base(&self, process: ProcessId, base: Address) -> Option<VirtualIdx> {
        self.by_base.get(&(process, base)).copied()
    }

    /// Live allocation of `process` whose range holds `address`.
    pub fn find_containing(&self, process: ProcessId, address: Address) -> Option<VirtualIdx> {
        let (_, &idx) = self
            .by_base
            .range((process, 0)..=(process, address))
            .next_back()?;
        self.get(idx)
            .filter(|allocation| allocation.contains(address))
            .map(|_| idx)
    }

    /// Live allocations whose byte size lies in `[min, max]`, smallest first.
    pub fn allocations_in_size_range(&self, min: u64, max: u64) -> Vec<VirtualIdx> {
        if min > max {
            return Vec::new();
        }
        self.by_size
            .range((min, VirtualIdx(0))..=(max, VirtualIdx(u32::MAX)))
            .map(|&(_, idx)| idx)
            .collect()
    }

    pub fn live(&self) -> impl Iterator<Item = (VirtualIdx, &VirtualAllocation)> {
        self.by_base
            .values()
            .filter_map(|&idx| self.get(idx).map(|allocation| (idx, allocation)))
    }

    pub fn live_indices(&self) -> Vec<VirtualIdx> {
        let mut indices: Vec<VirtualIdx> = self.by_base.values().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Every retained record, live or destroyed, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (VirtualIdx, &VirtualAllocation)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_deref()
                .map(|allocation| (VirtualIdx(index as u32), allocation))
        })
    }

    pub fn live_count(&self) -> usize {
        self.by_base.len()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Drops records destroyed before `before`. Slots stay in place.
    pub fn compact(&mut self, before: Timestamp) -> usize {
        let (expired, kept): (Vec<VirtualIdx>, Vec<VirtualIdx>) =
            self.retiring.iter().partition(|&&idx| {
                self.get(idx)
                    .and_then(|allocation| allocation.destroyed)
                    .is_some_and(|destroyed| destroyed < before)
            });
        self.retiring = kept;
        if !expired.is_empty() {
            let slots = Arc::make_mut(&mut self.slots);
            for idx in &expired {
                if let Some(slot) = slots.get_mut(idx.index()) {
                    *slot = None;
                }
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(handle: Handle, base: Address, pages: u64) -> VirtualAllocation {
        VirtualAllocation::new(handle, 1, base, pages * PAGE_SIZE, 100)
    }

    #[test]
    fn overlapping_insert_rejected() {
        let mut list = VirtualAllocationList::new();
        list.insert(alloc(1, 0x10000, 2)).unwrap();
        assert!(matches!(
            list.insert(alloc(2, 0x10800, 1)),
            Err(Error::DuplicateAllocation { address: 0x10800 })
        ));
        assert!(matches!(
            list.insert(alloc(3, 0xF000, 2)),
            Err(Error::DuplicateAllocation { .. })
        ));
        assert!(list.insert(alloc(4, 0x12000, 1)).is_ok());
    }

    #[test]
    fn same_range_in_other_process_allowed() {
        let mut list = VirtualAllocationList::new();
        list.insert(alloc(1, 0x10000, 2)).unwrap();
        let other = VirtualAllocation::new(2, 9, 0x10000, 2 * PAGE_SIZE, 100);
        assert!(list.insert(other).is_ok());
    }

    #[test]
    fn duplicate_handle_rejected() {
        let mut list = VirtualAllocationList::new();
        list.insert(alloc(1, 0x10000, 1)).unwrap();
        assert!(list.insert(alloc(1, 0x40000, 1)).is_err());
    }

    #[test]
    fn destroyed_record_retained_until_compaction() {
        let mut list = VirtualAllocationList::new();
        let idx = list.insert(alloc(1, 0x10000, 1)).unwrap();
        assert_eq!(list.destroy(1, 0x10000, 150), Some(idx));
        assert_eq!(list.live_count(), 0);
        assert_eq!(list.get(idx).and_then(|a| a.destroyed), Some(150));
        assert!(list.insert(alloc(1, 0x10000, 1)).is_ok());
        assert_eq!(list.compact(150), 0);
        assert_eq!(list.compact(151), 1);
        assert!(list.get(idx).is_none());
        assert_eq!(list.slot_count(), 2);
    }

    #[test]
    fn clone_keeps_records_the_original_compacts() {
        let mut list = VirtualAllocationList::new();
        let idx = list.insert(alloc(1, 0x10000, 1)).unwrap();
        list.destroy(1, 0x10000, 10);
        let checkpoint = list.clone();
        assert_eq!(list.compact(20), 1);
        assert!(list.get(idx).is_none());
        assert_eq!(checkpoint.get(idx).and_then(|a| a.destroyed), Some(10));
    }

    #[test]
    fn containing_and_size_queries() {
        let mut list = VirtualAllocationList::new();
        let small = list.insert(alloc(1, 0x10000, 1)).unwrap();
        let large = list.insert(alloc(2, 0x20000, 8)).unwrap();
        assert_eq!(list.find_containing(1, 0x20000 + 5 * PAGE_SIZE), Some(large));
        assert_eq!(list.find_containing(1, 0x11000), None);
        assert_eq!(list.allocations_in_size_range(0, PAGE_SIZE), vec![small]);
        assert_eq!(
            list.allocations_in_size_range(0, u64::MAX),
            vec![small, large]
        );
    }
}
