//! Event history of a single resource.
//!
//! Replay starts from an index checkpoint taken before the resource existed
//! and follows the outcome of every applied event. Record indices are stable
//! across replays of one trace, so the records to follow are known up front.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use serde::Serialize;

use crate::format::token::{PageTableUpdate, Token};
use crate::parser::TokenHeap;
use crate::state::{Applied, ApplyContext, LiveState, ResourceIdx, VirtualIdx};
use crate::types::{
    Address, Handle, ProcessId, Residency, ResourceUsage, Timestamp, PAGE_SIZE,
};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Created,
    Bound,
    Unbound,
    CpuMapped,
    CpuUnmapped,
    PageMapped,
    PageUnmapped,
    Correlated,
    Implicit,
    Named,
    Residency,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryPayload {
    None,
    Resource {
        usage: ResourceUsage,
        size: u64,
    },
    Binding {
        process: ProcessId,
        virtual_address: Address,
        size: u64,
        allocation: Option<Handle>,
    },
    Allocation {
        handle: Handle,
        base: Address,
    },
    Pages {
        process: ProcessId,
        virtual_address: Address,
        physical_address: Address,
        bytes: u64,
    },
    Name {
        name: String,
    },
    Residency {
        resident: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEvent {
    pub timestamp: Timestamp,
    pub thread: u8,
    pub kind: HistoryKind,
    pub payload: HistoryPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceHistory {
    pub id: Handle,
    pub events: Vec<HistoryEvent>,
}

impl ResourceHistory {
    pub fn kinds(&self) -> Vec<HistoryKind> {
        self.events.iter().map(|event| event.kind).collect()
    }
}

/// Applies events from `heap` to `state` up to the end of `range` and keeps
/// those touching one of `targets`. Events before the start of `range` are
/// applied but not recorded.
pub fn collect(
    heap: &mut TokenHeap<'_>,
    state: &mut LiveState,
    ctx: &ApplyContext<'_>,
    id: Handle,
    targets: &BTreeSet<ResourceIdx>,
    range: RangeInclusive<Timestamp>,
) -> Result<ResourceHistory> {
    let mut history = ResourceHistory {
        id,
        events: Vec::new(),
    };
    while heap
        .peek_timestamp()
        .is_some_and(|next| next <= *range.end())
    {
        let Some(event) = heap.next()? else {
            break;
        };
        let applied = state.apply(&event, ctx)?;
        if event.timestamp < *range.start() {
            continue;
        }
        let recorded = match (&applied, &event.token) {
            (_, Token::PageTableUpdate(update)) => page_event(state, targets, update),
            _ => classify(state, targets, &applied),
        };
        if let Some((kind, payload)) = recorded {
            history.events.try_reserve(1)?;
            history.events.push(HistoryEvent {
                timestamp: event.timestamp,
                thread: event.thread,
                kind,
                payload,
            });
        }
    }
    Ok(history)
}

fn bound_to(state: &LiveState, targets: &BTreeSet<ResourceIdx>, allocation: VirtualIdx) -> bool {
    targets.iter().any(|&idx| {
        state
            .resources
            .get(idx)
            .is_some_and(|r| r.is_live() && r.allocation == Some(allocation))
    })
}

fn allocation_payload(state: &LiveState, allocation: VirtualIdx) -> HistoryPayload {
    state
        .virtual_allocs
        .get(allocation)
        .map_or(HistoryPayload::None, |a| HistoryPayload::Allocation {
            handle: a.handle,
            base: a.base,
        })
}

fn classify(
    state: &LiveState,
    targets: &BTreeSet<ResourceIdx>,
    applied: &Applied,
) -> Option<(HistoryKind, HistoryPayload)> {
    let resource_payload = |idx: ResourceIdx| {
        state
            .resources
            .get(idx)
            .map_or(HistoryPayload::None, |r| HistoryPayload::Resource {
                usage: r.usage,
                size: r.size,
            })
    };
    match *applied {
        Applied::Created(idx) | Applied::Merged(idx) if targets.contains(&idx) => {
            Some((HistoryKind::Created, resource_payload(idx)))
        }
        Applied::Implicit(idx) if targets.contains(&idx) => {
            Some((HistoryKind::Implicit, resource_payload(idx)))
        }
        Applied::Correlated(idx) if targets.contains(&idx) => {
            Some((HistoryKind::Correlated, HistoryPayload::None))
        }
        Applied::Named(idx) if targets.contains(&idx) => {
            let name = state
                .resources
                .get(idx)
                .and_then(|r| r.name())
                .unwrap_or_default()
                .to_owned();
            Some((HistoryKind::Named, HistoryPayload::Name { name }))
        }
        Applied::Destroyed(idx) if targets.contains(&idx) => {
            Some((HistoryKind::Destroyed, HistoryPayload::None))
        }
        Applied::Bound {
            resource,
            allocation,
            ..
        } if targets.contains(&resource) => {
            let record = state.resources.get(resource)?;
            Some((
                HistoryKind::Bound,
                HistoryPayload::Binding {
                    process: record.process,
                    virtual_address: record.virtual_address,
                    size: record.size,
                    allocation: allocation
                        .and_then(|idx| state.virtual_allocs.get(idx))
                        .map(|a| a.handle),
                },
            ))
        }
        Applied::VirtualFreed {
            allocation,
            ref unbound,
        } if unbound.iter().any(|idx| targets.contains(idx)) => {
            Some((HistoryKind::Unbound, allocation_payload(state, allocation)))
        }
        Applied::CpuMapped(allocation) if bound_to(state, targets, allocation) => {
            Some((HistoryKind::CpuMapped, allocation_payload(state, allocation)))
        }
        Applied::CpuUnmapped(allocation) if bound_to(state, targets, allocation) => {
            Some((HistoryKind::CpuUnmapped, allocation_payload(state, allocation)))
        }
        Applied::Residency(allocation) if bound_to(state, targets, allocation) => {
            let resident = state
                .virtual_allocs
                .get(allocation)
                .is_some_and(|a| a.residency == Residency::Resident);
            Some((HistoryKind::Residency, HistoryPayload::Residency { resident }))
        }
        _ => None,
    }
}

fn page_event(
    state: &LiveState,
    targets: &BTreeSet<ResourceIdx>,
    update: &PageTableUpdate,
) -> Option<(HistoryKind, HistoryPayload)> {
    let start = update.virtual_address;
    let end = start.saturating_add(update.small_pages().saturating_mul(PAGE_SIZE));
    let touches = targets.iter().any(|&idx| {
        state.resources.get(idx).is_some_and(|r| {
            r.is_live()
                && r.is_bound()
                && r.process == update.process
                && r.virtual_address < end
                && start < r.end_address()
        })
    });
    if !touches {
        return None;
    }
    let kind = if update.unmap {
        HistoryKind::PageUnmapped
    } else {
        HistoryKind::PageMapped
    };
    Some((
        kind,
        HistoryPayload::Pages {
            process: update.process,
            virtual_address: update.virtual_address,
            physical_address: update.physical_address,
            bytes: end - start,
        },
    ))
}
