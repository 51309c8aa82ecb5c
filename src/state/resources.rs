use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::debug;
use serde::Serialize;

use super::{ResourceIdx, VirtualIdx};
use crate::config::DuplicateResourcePolicy;
use crate::format::token::{ResourceCreate, ResourceDescription};
use crate::types::{
    Address, CommitType, Handle, OwnerType, ProcessId, ResourceUsage, Timestamp,
};
use crate::{Error, Result};

/// High bit marks identifiers synthesised for implicit resources.
pub const IMPLICIT_ID_BASE: Handle = 1 << 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    /// Canonical identifier.
    pub id: Handle,
    /// Every identifier that has referred to this record, canonical first.
    pub identifiers: Vec<Handle>,
    pub correlation: Handle,
    pub process: ProcessId,
    pub allocation: Option<VirtualIdx>,
    pub virtual_address: Address,
    /// Offset of the bound range within its allocation.
    pub offset: u64,
    pub size: u64,
    pub usage: ResourceUsage,
    pub description: Option<ResourceDescription>,
    pub owner: OwnerType,
    pub commit: CommitType,
    pub created: Timestamp,
    pub bound_at: Option<Timestamp>,
    pub destroyed: Option<Timestamp>,
    pub debug_name: Option<Arc<str>>,
    pub implicit_name: Option<Arc<str>>,
    pub implicit: bool,
    pub system_memory: bool,
    #[serde(skip)]
    create_seen: bool,
}

impl Resource {
    fn from_create(create: &ResourceCreate, timestamp: Timestamp) -> Self {
        let mut resource = Self {
            id: create.id,
            identifiers: vec![create.id],
            correlation: create.correlation,
            process: 0,
            allocation: None,
            virtual_address: 0,
            offset: 0,
            size: 0,
            usage: ResourceUsage::Unknown,
            description: None,
            owner: create.owner,
            commit: create.commit,
            created: timestamp,
            bound_at: None,
            destroyed: None,
            debug_name: None,
            implicit_name: None,
            implicit: false,
            system_memory: false,
            create_seen: true,
        };
        resource.apply_description(&create.description);
        resource
    }

    /// Usage is decided by the first discriminator observed.
    fn apply_description(&mut self, description: &ResourceDescription) {
        if self.usage == ResourceUsage::Unknown {
            self.usage = description.usage();
        }
        if self.size == 0 {
            self.size = match *description {
                ResourceDescription::Buffer { size, .. }
                | ResourceDescription::Heap { size, .. }
                | ResourceDescription::AccelerationStructure { size, .. } => size,
                _ => 0,
            };
        }
        self.description = Some(description.clone());
    }

    pub fn is_live(&self) -> bool {
        self.destroyed.is_none()
    }

    pub fn is_bound(&self) -> bool {
        self.allocation.is_some()
    }

    pub fn end_address(&self) -> Address {
        self.virtual_address.saturating_add(self.size)
    }

    pub fn name(&self) -> Option<&str> {
        self.debug_name
            .as_deref()
            .or(self.implicit_name.as_deref())
    }

    pub fn is_alive_at(&self, timestamp: Timestamp) -> bool {
        self.created <= timestamp && self.destroyed.map_or(true, |destroyed| timestamp < destroyed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(ResourceIdx),
    /// The create completed an implicit record.
    Merged(ResourceIdx),
    /// A live record already owned the identifier and was kept.
    Ignored(ResourceIdx),
}

impl CreateOutcome {
    pub fn index(self) -> ResourceIdx {
        match self {
            CreateOutcome::Created(idx) | CreateOutcome::Merged(idx) | CreateOutcome::Ignored(idx) => {
                idx
            }
        }
    }
}

/// Resource registry with the identifier map that folds renamed and
/// correlated identifiers onto one canonical record.
///
/// Every identifier in the map is also listed in its record's `identifiers`,
/// so destroying a record unmaps exactly those keys.
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    slots: Arc<Vec<Option<Arc<Resource>>>>,
    identifiers: Arc<HashMap<Handle, ResourceIdx>>,
    live: Arc<BTreeSet<ResourceIdx>>,
    retiring: Vec<ResourceIdx>,
    implicit_counter: u64,
}

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        create: &ResourceCreate,
        timestamp: Timestamp,
        policy: DuplicateResourcePolicy,
    ) -> Result<CreateOutcome> {
        let existing = self
            .find(create.id)
            .or_else(|| (create.correlation != 0).then(|| self.find(create.correlation)).flatten());
        if let Some(idx) = existing {
            let resource = self.get_mut(idx).ok_or(Error::UnknownResource(create.id))?;
            if resource.implicit && !resource.create_seen {
                resource.create_seen = true;
                resource.owner = create.owner;
                resource.commit = create.commit;
                if resource.correlation == 0 {
                    resource.correlation = create.correlation;
                }
                resource.apply_description(&create.description);
                self.add_identifier(idx, create.id);
                self.add_identifier(idx, create.correlation);
                return Ok(CreateOutcome::Merged(idx));
            }
            return match policy {
                DuplicateResourcePolicy::KeepFirst => {
                    debug!("ignoring repeated create of live resource {}", create.id);
                    Ok(CreateOutcome::Ignored(idx))
                }
                DuplicateResourcePolicy::Reject => Err(Error::DuplicateResource(create.id)),
            };
        }

        let idx = self.push(Resource::from_create(create, timestamp))?;
        self.add_identifier(idx, create.id);
        self.add_identifier(idx, create.correlation);
        Ok(CreateOutcome::Created(idx))
    }

    /// Records an implicit resource. An existing record for `original_id` is
    /// flagged implicit; otherwise a record with a synthesised identifier is made.
    pub fn create_implicit(
        &mut self,
        original_id: Handle,
        resource_type: u8,
        timestamp: Timestamp,
    ) -> Result<ResourceIdx> {
        if let Some(idx) = self.find(original_id) {
            if let Some(resource) = self.get_mut(idx) {
                resource.implicit = true;
            }
            return Ok(idx);
        }
        let usage = ResourceDescription::usage_for_discriminator(resource_type);
        let id = IMPLICIT_ID_BASE | self.implicit_counter;
        self.implicit_counter += 1;
        let resource = Resource {
            id,
            identifiers: vec![id, original_id],
            correlation: 0,
            process: 0,
            allocation: None,
            virtual_address: 0,
            offset: 0,
            size: 0,
            usage,
            description: None,
            owner: OwnerType::Driver,
            commit: CommitType::Committed,
            created: timestamp,
            bound_at: None,
            destroyed: None,
            debug_name: None,
            implicit_name: Some(Arc::from(format!(
                "implicit {} {original_id:#x}",
                usage.name()
            ))),
            implicit: true,
            system_memory: false,
            create_seen: false,
        };
        let idx = self.push(resource)?;
        self.alias(id, idx);
        self.alias(original_id, idx);
        Ok(idx)
    }

    fn push(&mut self, resource: Resource) -> Result<ResourceIdx> {
        let slots = Arc::make_mut(&mut self.slots);
        slots.try_reserve(1)?;
        let idx = ResourceIdx(slots.len() as u32);
        slots.push(Some(Arc::new(resource)));
        Arc::make_mut(&mut self.live).insert(idx);
        Ok(idx)
    }

    /// Makes `id` resolve to `idx`. Callers list `id` on the record too.
    fn alias(&mut self, id: Handle, idx: ResourceIdx) {
        if id != 0 {
            Arc::make_mut(&mut self.identifiers).insert(id, idx);
        }
    }

    /// Folds `id` onto the record at `idx`.
    pub fn add_identifier(&mut self, idx: ResourceIdx, id: Handle) {
        if id == 0 {
            return;
        }
        if let Some(resource) = self.get_mut(idx) {
            if !resource.identifiers.contains(&id) {
                resource.identifiers.push(id);
            }
        }
        self.alias(id, idx);
    }

    /// Marks the record destroyed and forgets every identifier pointing at it.
    pub fn destroy(&mut self, id: Handle, timestamp: Timestamp) -> Option<ResourceIdx> {
        let idx = self.find(id)?;
        let resource = self.get_mut(idx)?;
        resource.destroyed = Some(timestamp);
        let identifiers = resource.identifiers.clone();
        let map = Arc::make_mut(&mut self.identifiers);
        for identifier in identifiers {
            if map.get(&identifier) == Some(&idx) {
                map.remove(&identifier);
            }
        }
        Arc::make_mut(&mut self.live).remove(&idx);
        self.retiring.push(idx);
        Some(idx)
    }

    pub fn find(&self, id: Handle) -> Option<ResourceIdx> {
        self.identifiers.get(&id).copied()
    }

    pub fn get(&self, idx: ResourceIdx) -> Option<&Resource> {
        self.slots.get(idx.index())?.as_deref()
    }

    pub fn get_mut(&mut self, idx: ResourceIdx) -> Option<&mut Resource> {
        Arc::make_mut(&mut self.slots)
            .get_mut(idx.index())?
            .as_mut()
            .map(Arc::make_mut)
    }

    /// Live records in creation order.
    pub fn live(&self) -> impl Iterator<Item = (ResourceIdx, &Resource)> {
        self.live
            .iter()
            .filter_map(|&idx| self.get(idx).map(|resource| (idx, resource)))
    }

    pub fn live_indices(&self) -> Vec<ResourceIdx> {
        self.live.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceIdx, &Resource)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_deref()
                .map(|resource| (ResourceIdx(index as u32), resource))
        })
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Takes records destroyed before `before` out of their slots and
    /// appends them to `retired`.
    pub fn compact(
        &mut self,
        before: Timestamp,
        retired: &mut Vec<(ResourceIdx, Arc<Resource>)>,
    ) -> Result<usize> {
        let (expired, kept): (Vec<ResourceIdx>, Vec<ResourceIdx>) =
            self.retiring.iter().partition(|&&idx| {
                self.get(idx)
                    .and_then(|resource| resource.destroyed)
                    .is_some_and(|destroyed| destroyed < before)
            });
        self.retiring = kept;
        if expired.is_empty() {
            return Ok(0);
        }
        retired.try_reserve(expired.len())?;
        let slots = Arc::make_mut(&mut self.slots);
        for &idx in &expired {
            if let Some(resource) = slots.get_mut(idx.index()).and_then(Option::take) {
                retired.push((idx, resource));
            }
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: Handle, correlation: Handle) -> ResourceCreate {
        ResourceCreate {
            id,
            correlation,
            owner: OwnerType::Application,
            commit: CommitType::Placed,
            description: ResourceDescription::Buffer {
                size: 0x2000,
                usage_flags: 0,
                create_flags: 0,
            },
        }
    }

    #[test]
    fn repeated_create_keeps_first_when_lenient() -> Result<()> {
        let mut list = ResourceList::new();
        let first = list.create(&buffer(7, 0), 10, DuplicateResourcePolicy::KeepFirst)?;
        let second = list.create(&buffer(7, 0), 20, DuplicateResourcePolicy::KeepFirst)?;
        assert_eq!(second, CreateOutcome::Ignored(first.index()));
        assert_eq!(list.get(first.index()).map(|r| r.created), Some(10));
        assert_eq!(list.live_count(), 1);
        Ok(())
    }

    #[test]
    fn repeated_create_fails_when_strict() -> Result<()> {
        let mut list = ResourceList::new();
        list.create(&buffer(7, 0), 10, DuplicateResourcePolicy::Reject)?;
        assert!(matches!(
            list.create(&buffer(7, 0), 20, DuplicateResourcePolicy::Reject),
            Err(Error::DuplicateResource(7))
        ));
        Ok(())
    }

    #[test]
    fn implicit_record_merges_later_create() -> Result<()> {
        let mut list = ResourceList::new();
        let idx = list.create_implicit(0x55, 4, 5)?;
        let resource = list.get(idx).unwrap();
        assert_eq!(resource.id, IMPLICIT_ID_BASE);
        assert_eq!(resource.usage, ResourceUsage::Heap);
        let outcome = list.create(&buffer(0x55, 0x99), 6, DuplicateResourcePolicy::Reject)?;
        assert_eq!(outcome, CreateOutcome::Merged(idx));
        let resource = list.get(idx).unwrap();
        assert_eq!(resource.usage, ResourceUsage::Heap);
        assert_eq!(resource.created, 5);
        assert_eq!(list.find(0x99), Some(idx));
        Ok(())
    }

    #[test]
    fn destroy_forgets_every_identifier() -> Result<()> {
        let mut list = ResourceList::new();
        let idx = list
            .create(&buffer(1, 2), 10, DuplicateResourcePolicy::KeepFirst)?
            .index();
        assert_eq!(list.destroy(2, 30), Some(idx));
        assert_eq!(list.find(1), None);
        assert_eq!(list.find(2), None);
        assert_eq!(list.destroy(1, 31), None);
        assert!(!list.get(idx).unwrap().is_alive_at(30));
        assert!(list.get(idx).unwrap().is_alive_at(29));
        assert_eq!(list.iter().count(), 1);

        let mut retired = Vec::new();
        assert_eq!(list.compact(30, &mut retired)?, 0);
        assert_eq!(list.compact(31, &mut retired)?, 1);
        assert!(list.get(idx).is_none());
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].0, idx);
        assert_eq!(retired[0].1.identifiers, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn reused_identifier_survives_destroy_of_old_record() -> Result<()> {
        let mut list = ResourceList::new();
        let old = list
            .create(&buffer(1, 0), 10, DuplicateResourcePolicy::KeepFirst)?
            .index();
        list.add_identifier(old, 0x40);
        let new = list
            .create(&buffer(2, 0), 11, DuplicateResourcePolicy::KeepFirst)?
            .index();
        list.add_identifier(new, 0x40);
        assert_eq!(list.destroy(1, 12), Some(old));
        assert_eq!(list.find(0x40), Some(new));
        Ok(())
    }
}
