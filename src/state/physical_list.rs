use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use super::PhysicalIdx;
use crate::types::{bytes_to_pages, Address, Handle, SegmentId, Timestamp, PAGE_SIZE};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalAllocation {
    pub handle: Handle,
    pub base: Address,
    pub size_pages: u64,
    pub segment: SegmentId,
    pub created: Timestamp,
    pub destroyed: Option<Timestamp>,
}

impl PhysicalAllocation {
    pub fn new(
        handle: Handle,
        base: Address,
        size_bytes: u64,
        segment: SegmentId,
        created: Timestamp,
    ) -> Self {
        Self {
            handle,
            base,
            size_pages: bytes_to_pages(size_bytes),
            segment,
            created,
            destroyed: None,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_pages.saturating_mul(PAGE_SIZE)
    }

    pub fn end(&self) -> Address {
        self.base.saturating_add(self.size_bytes())
    }

    pub fn is_live(&self) -> bool {
        self.destroyed.is_none()
    }
}

/// Registry of physical allocations, keyed per segment. Shares its slots and
/// indices with clones the same way as the virtual list.
#[derive(Debug, Clone, Default)]
pub struct PhysicalAllocationList {
    slots: Arc<Vec<Option<Arc<PhysicalAllocation>>>>,
    by_base: Arc<BTreeMap<(SegmentId, Address), PhysicalIdx>>,
    by_handle: Arc<HashMap<Handle, PhysicalIdx>>,
    by_size: Arc<BTreeSet<(u64, PhysicalIdx)>>,
    retiring: Vec<PhysicalIdx>,
}

impl PhysicalAllocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, allocation: PhysicalAllocation) -> Result<PhysicalIdx> {
        let duplicate = Error::DuplicateAllocation {
            address: allocation.base,
        };
        if self.by_handle.contains_key(&allocation.handle) {
            return Err(duplicate);
        }
        let segment = allocation.segment;
        if let Some((_, &idx)) = self
            .by_base
            .range((segment, 0)..=(segment, allocation.base))
            .next_back()
        {
            if self.get(idx).is_some_and(|prev| prev.end() > allocation.base) {
                return Err(duplicate);
            }
        }
        if let Some((&(_, next_base), _)) = self
            .by_base
            .range((segment, allocation.base)..(segment, Address::MAX))
            .next()
        {
            if next_base < allocation.end() || next_base == allocation.base {
                return Err(duplicate);
            }
        }

        let slots = Arc::make_mut(&mut self.slots);
        slots.try_reserve(1)?;
        let idx = PhysicalIdx(slots.len() as u32);
        Arc::make_mut(&mut self.by_base).insert((segment, allocation.base), idx);
        Arc::make_mut(&mut self.by_handle).insert(allocation.handle, idx);
        Arc::make_mut(&mut self.by_size).insert((allocation.size_bytes(), idx));
        slots.push(Some(Arc::new(allocation)));
        Ok(idx)
    }

    pub fn destroy(
        &mut self,
        segment: SegmentId,
        base: Address,
        timestamp: Timestamp,
    ) -> Option<PhysicalIdx> {
        let idx = Arc::make_mut(&mut self.by_base).remove(&(segment, base))?;
        let allocation = Arc::make_mut(&mut self.slots)
            .get_mut(idx.index())?
            .as_mut()
            .map(Arc::make_mut)?;
        allocation.destroyed = Some(timestamp);
        let handle = allocation.handle;
        let size = allocation.size_bytes();
        Arc::make_mut(&mut self.by_handle).remove(&handle);
        Arc::make_mut(&mut self.by_size).remove(&(size, idx));
        self.retiring.push(idx);
        Some(idx)
    }

    pub fn get(&self, idx: PhysicalIdx) -> Option<&PhysicalAllocation> {
        self.slots.get(idx.index())?.as_deref()
    }

    pub fn find_by_handle(&self, handle: Handle) -> Option<PhysicalIdx> {
        self.by_handle.get(&handle).copied()
    }

    pub fn find_by_base(&self, segment: SegmentId, base: Address) -> Option<PhysicalIdx> {
        self.by_base.get(&(segment, base)).copied()
    }

    pub fn allocations_in_size_range(&self, min: u64, max: u64) -> Vec<PhysicalIdx> {
        if min > max {
            return Vec::new();
        }
        self.by_size
            .range((min, PhysicalIdx(0))..=(max, PhysicalIdx(u32::MAX)))
            .map(|&(_, idx)| idx)
            .collect()
    }

    pub fn live(&self) -> impl Iterator<Item = (PhysicalIdx, &PhysicalAllocation)> {
        self.by_base
            .values()
            .filter_map(|&idx| self.get(idx).map(|allocation| (idx, allocation)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PhysicalIdx, &PhysicalAllocation)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_deref()
                .map(|allocation| (PhysicalIdx(index as u32), allocation))
        })
    }

    pub fn live_count(&self) -> usize {
        self.by_base.len()
    }

    pub fn compact(&mut self, before: Timestamp) -> usize {
        let (expired, kept): (Vec<PhysicalIdx>, Vec<PhysicalIdx>) =
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

    #[test]
    fn overlap_checked_per_segment() {
        let mut list = PhysicalAllocationList::new();
        list.insert(PhysicalAllocation::new(1, 0x8000_0000, 0x4000, SegmentId(0), 1))
            .unwrap();
        assert!(list
            .insert(PhysicalAllocation::new(2, 0x8000_2000, 0x1000, SegmentId(0), 2))
            .is_err());
        assert!(list
            .insert(PhysicalAllocation::new(3, 0x8000_2000, 0x1000, SegmentId(1), 2))
            .is_ok());
    }

    #[test]
    fn free_then_reallocate_same_base() {
        let mut list = PhysicalAllocationList::new();
        let first = list
            .insert(PhysicalAllocation::new(1, 0x1000, 0x1000, SegmentId(0), 1))
            .unwrap();
        assert_eq!(list.destroy(SegmentId(0), 0x1000, 5), Some(first));
        assert_eq!(list.destroy(SegmentId(0), 0x1000, 6), None);
        let second = list
            .insert(PhysicalAllocation::new(1, 0x1000, 0x1000, SegmentId(0), 7))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(list.live_count(), 1);
        assert_eq!(list.iter().count(), 2);
        assert_eq!(list.compact(7), 1);
        assert_eq!(list.iter().count(), 1);
        assert_eq!(
            list.allocations_in_size_range(0x1000, 0x1000),
            vec![second]
        );
    }
}
