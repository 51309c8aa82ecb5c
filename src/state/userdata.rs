//! Correlation of user-data tokens with resource records.
//!
//! Drivers emit debug names and correlation handles separately from the
//! resource-create token, in either order. Names that arrive before their
//! resource wait in a pending set keyed by correlation handle.

use std::collections::HashMap;
use std::sync::Arc;

use super::resources::ResourceList;
use super::ResourceIdx;
use crate::strings::StringPool;
use crate::types::Handle;

/// Parked names and correlations. Entries leave the maps once they reach a
/// record, so both stay as small as the set of unresolved handles.
#[derive(Debug, Clone, Default)]
pub struct UserDataState {
    /// Correlation handle to the resource identifier it names, for resources
    /// not created yet.
    correlations: Arc<HashMap<Handle, Handle>>,
    /// Reverse of `correlations`: resource identifier to waiting handles.
    waiting: Arc<HashMap<Handle, Vec<Handle>>>,
    pending_names: Arc<HashMap<Handle, Arc<str>>>,
}

impl UserDataState {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, handle: Handle, resources: &ResourceList) -> Option<ResourceIdx> {
        self.correlations
            .get(&handle)
            .and_then(|&id| resources.find(id))
            .or_else(|| resources.find(handle))
    }

    /// Names the resource behind `correlation`, or parks the name until it appears.
    pub fn debug_name(
        &mut self,
        correlation: Handle,
        name: &str,
        resources: &mut ResourceList,
        strings: &mut StringPool,
    ) -> Option<ResourceIdx> {
        let name = strings.intern(name);
        match self.resolve(correlation, resources) {
            Some(idx) => {
                if let Some(resource) = resources.get_mut(idx) {
                    resource.debug_name = Some(name);
                }
                Some(idx)
            }
            None => {
                Arc::make_mut(&mut self.pending_names).insert(correlation, name);
                None
            }
        }
    }

    /// Links `correlation` to `resource_id` and folds both onto one record.
    /// Without a record yet, the link waits for [`bind_pending`](Self::bind_pending).
    pub fn correlate(
        &mut self,
        correlation: Handle,
        resource_id: Handle,
        resources: &mut ResourceList,
    ) -> Option<ResourceIdx> {
        let Some(idx) = resources
            .find(resource_id)
            .or_else(|| resources.find(correlation))
        else {
            if let Some(previous) =
                Arc::make_mut(&mut self.correlations).insert(correlation, resource_id)
            {
                self.forget_waiting(previous, correlation);
            }
            Arc::make_mut(&mut self.waiting)
                .entry(resource_id)
                .or_default()
                .push(correlation);
            return None;
        };
        resources.add_identifier(idx, resource_id);
        resources.add_identifier(idx, correlation);
        if let Some(resource) = resources.get_mut(idx) {
            if resource.correlation == 0 {
                resource.correlation = correlation;
            }
        }
        self.bind_pending(idx, resources);
        Some(idx)
    }

    fn forget_waiting(&mut self, resource_id: Handle, correlation: Handle) {
        let waiting = Arc::make_mut(&mut self.waiting);
        if let Some(handles) = waiting.get_mut(&resource_id) {
            handles.retain(|&handle| handle != correlation);
            if handles.is_empty() {
                waiting.remove(&resource_id);
            }
        }
    }

    /// Folds waiting correlations into the record and attaches any parked name
    /// that refers to one of its identifiers.
    pub fn bind_pending(&mut self, idx: ResourceIdx, resources: &mut ResourceList) -> bool {
        let Some(resource) = resources.get(idx) else {
            return false;
        };
        let identifiers = resource.identifiers.clone();
        let own_correlation = resource.correlation;

        let mut arrived = Vec::new();
        for id in &identifiers {
            if self.waiting.contains_key(id) {
                if let Some(handles) = Arc::make_mut(&mut self.waiting).remove(id) {
                    arrived.extend(handles);
                }
            }
        }
        for &correlation in &arrived {
            Arc::make_mut(&mut self.correlations).remove(&correlation);
            resources.add_identifier(idx, correlation);
        }
        if let (Some(&first), Some(resource)) = (arrived.first(), resources.get_mut(idx)) {
            if resource.correlation == 0 {
                resource.correlation = first;
            }
        }

        if self.pending_names.is_empty() {
            return false;
        }
        let name = identifiers
            .iter()
            .chain(std::iter::once(&own_correlation))
            .chain(arrived.iter())
            .filter(|&&key| key != 0)
            .find(|&key| self.pending_names.contains_key(key))
            .and_then(|key| Arc::make_mut(&mut self.pending_names).remove(key));
        match (name, resources.get_mut(idx)) {
            (Some(name), Some(resource)) => {
                resource.debug_name = Some(name);
                true
            }
            _ => false,
        }
    }

    /// Names still waiting for their resource.
    pub fn pending_name_count(&self) -> usize {
        self.pending_names.len()
    }

    /// Correlations still waiting for their resource.
    pub fn correlation_count(&self) -> usize {
        self.correlations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicateResourcePolicy;
    use crate::format::token::{ResourceCreate, ResourceDescription};
    use crate::types::{CommitType, OwnerType};

    fn create(id: Handle, correlation: Handle) -> ResourceCreate {
        ResourceCreate {
            id,
            correlation,
            owner: OwnerType::Application,
            commit: CommitType::Committed,
            description: ResourceDescription::MiscInternal { kind: 0 },
        }
    }

    #[test]
    fn name_before_create_is_bound_on_create() {
        let mut state = UserDataState::new();
        let mut resources = ResourceList::new();
        let mut strings = StringPool::new();
        assert_eq!(state.debug_name(0xC0, "vertex buffer", &mut resources, &mut strings), None);
        assert_eq!(state.pending_name_count(), 1);

        let idx = resources
            .create(&create(5, 0xC0), 10, DuplicateResourcePolicy::KeepFirst)
            .unwrap()
            .index();
        assert!(state.bind_pending(idx, &mut resources));
        assert_eq!(resources.get(idx).unwrap().name(), Some("vertex buffer"));
        assert_eq!(state.pending_name_count(), 0);
    }

    #[test]
    fn correlation_routes_later_names() {
        let mut state = UserDataState::new();
        let mut resources = ResourceList::new();
        let mut strings = StringPool::new();
        let idx = resources
            .create(&create(5, 0), 10, DuplicateResourcePolicy::KeepFirst)
            .unwrap()
            .index();
        assert_eq!(state.correlate(0xAB, 5, &mut resources), Some(idx));
        assert_eq!(resources.find(0xAB), Some(idx));
        assert_eq!(
            state.debug_name(0xAB, "depth", &mut resources, &mut strings),
            Some(idx)
        );
        assert_eq!(resources.get(idx).unwrap().name(), Some("depth"));
    }

    #[test]
    fn correlation_binds_parked_name() {
        let mut state = UserDataState::new();
        let mut resources = ResourceList::new();
        let mut strings = StringPool::new();
        let idx = resources
            .create(&create(9, 0), 10, DuplicateResourcePolicy::KeepFirst)
            .unwrap()
            .index();
        state.debug_name(0x77, "gbuffer", &mut resources, &mut strings);
        state.correlate(0x77, 9, &mut resources);
        assert_eq!(resources.get(idx).unwrap().name(), Some("gbuffer"));
        assert_eq!(state.pending_name_count(), 0);
    }

    #[test]
    fn early_correlation_waits_for_create_then_clears() {
        let mut state = UserDataState::new();
        let mut resources = ResourceList::new();
        let mut strings = StringPool::new();
        assert_eq!(state.correlate(0xC1, 12, &mut resources), None);
        assert_eq!(
            state.debug_name(0xC1, "shadow map", &mut resources, &mut strings),
            None
        );
        assert_eq!(state.correlation_count(), 1);

        let idx = resources
            .create(&create(12, 0), 10, DuplicateResourcePolicy::KeepFirst)
            .unwrap()
            .index();
        assert!(state.bind_pending(idx, &mut resources));
        let resource = resources.get(idx).unwrap();
        assert_eq!(resource.name(), Some("shadow map"));
        assert_eq!(resource.correlation, 0xC1);
        assert_eq!(resources.find(0xC1), Some(idx));
        assert_eq!((state.correlation_count(), state.pending_name_count()), (0, 0));
    }
}
