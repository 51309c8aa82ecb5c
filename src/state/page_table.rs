//! Per-process virtual-to-physical page mapping stored as maximal runs.
//!
//! Each process owns an ordered map from first virtual page to a run record.
//! Runs never overlap. Neighbouring runs that continue each other physically
//! and share segment and update time are merged on insertion. Host, invalid
//! and system-reserved targets are stored as given and never merged.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{
    Address, ProcessId, SegmentId, Timestamp, MAX_SEGMENTS, PAGE_SHIFT, PAGE_SIZE,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappedTarget {
    /// Physical byte address backing the first page of the run.
    Physical(Address),
    /// Host memory reached through a host-visible segment.
    Host,
    Invalid,
    SystemReserved,
}

impl MappedTarget {
    fn advance(self, pages: u64) -> Self {
        match self {
            MappedTarget::Physical(address) => {
                MappedTarget::Physical(address.wrapping_add(pages.wrapping_mul(PAGE_SIZE)))
            }
            special => special,
        }
    }

    /// Whether the target is real memory, device or host.
    pub fn is_backed(self) -> bool {
        matches!(self, MappedTarget::Physical(_) | MappedTarget::Host)
    }

    pub fn physical_address(self) -> Option<Address> {
        match self {
            MappedTarget::Physical(address) => Some(address),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRun {
    pub virtual_page: u64,
    pub length: u64,
    pub target: MappedTarget,
    pub segment: SegmentId,
    pub updated_at: Timestamp,
}

impl PageRun {
    pub fn end(&self) -> u64 {
        self.virtual_page + self.length
    }

    pub fn contains(&self, page: u64) -> bool {
        page >= self.virtual_page && page < self.end()
    }

    /// Target of `page`, which must lie inside the run.
    pub fn target_at(&self, page: u64) -> MappedTarget {
        self.target.advance(page - self.virtual_page)
    }

    /// The part of this run inside `[start, end)`.
    pub fn clip(&self, start: u64, end: u64) -> PageRun {
        let start = start.max(self.virtual_page);
        let end = end.min(self.end());
        PageRun {
            virtual_page: start,
            length: end.saturating_sub(start),
            target: self.target_at(start),
            segment: self.segment,
            updated_at: self.updated_at,
        }
    }

    fn continued_by(&self, next: &PageRun) -> bool {
        if self.end() != next.virtual_page
            || self.segment != next.segment
            || self.updated_at != next.updated_at
        {
            return false;
        }
        match (self.target, next.target) {
            (MappedTarget::Physical(a), MappedTarget::Physical(b)) => {
                a.checked_add(self.length * PAGE_SIZE) == Some(b)
            }
            _ => false,
        }
    }
}

type RunMap = BTreeMap<u64, PageRun>;

#[derive(Debug, Clone, Default)]
pub struct PageTable {
    processes: BTreeMap<ProcessId, Arc<RunMap>>,
    mapped_pages: BTreeMap<ProcessId, u64>,
    segment_pages: [u64; MAX_SEGMENTS],
}

struct Counters<'a> {
    process: Option<&'a mut u64>,
    segments: Option<&'a mut [u64; MAX_SEGMENTS]>,
}

impl Counters<'_> {
    fn apply(&mut self, run: &PageRun, added: bool) {
        if !run.target.is_backed() {
            return;
        }
        if let Some(total) = self.process.as_deref_mut() {
            *total = if added {
                total.saturating_add(run.length)
            } else {
                total.saturating_sub(run.length)
            };
        }
        if let (Some(segments), true) = (self.segments.as_deref_mut(), run.segment.is_known()) {
            if let Some(slot) = segments.get_mut(run.segment.index()) {
                *slot = if added {
                    slot.saturating_add(run.length)
                } else {
                    slot.saturating_sub(run.length)
                };
            }
        }
    }
}

/// Highest page number whose byte address fits in 64 bits. Run ends stay at or
/// below it, so every page count converts to bytes without overflow.
pub const MAX_PAGE: u64 = u64::MAX >> PAGE_SHIFT;

fn range_end(virtual_page: u64, length: u64) -> Result<u64> {
    virtual_page
        .checked_add(length)
        .filter(|&end| end <= MAX_PAGE)
        .ok_or_else(|| Error::malformed("page range overflows the address space"))
}

/// Removes `[start, end)` from `runs`, splitting runs that straddle either end.
fn remove_range(runs: &mut RunMap, start: u64, end: u64, counters: &mut Counters<'_>) {
    let mut keys = Vec::new();
    if let Some((&key, run)) = runs.range(..start).next_back() {
        if run.end() > start {
            keys.push(key);
        }
    }
    keys.extend(runs.range(start..end).map(|(&key, _)| key));
    for key in keys {
        let Some(run) = runs.remove(&key) else {
            continue;
        };
        if run.virtual_page < start {
            runs.insert(run.virtual_page, run.clip(run.virtual_page, start));
        }
        if run.end() > end {
            runs.insert(end, run.clip(end, run.end()));
        }
        counters.apply(&run.clip(start, end), false);
    }
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `length` pages at `virtual_page` onto `target`, replacing any
    /// existing mapping of the range.
    pub fn map(
        &mut self,
        process: ProcessId,
        virtual_page: u64,
        target: MappedTarget,
        length: u64,
        segment: SegmentId,
        timestamp: Timestamp,
    ) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let end = range_end(virtual_page, length)?;
        let runs = Arc::make_mut(self.processes.entry(process).or_default());
        let mut counters = Counters {
            process: Some(self.mapped_pages.entry(process).or_default()),
            segments: Some(&mut self.segment_pages),
        };
        remove_range(runs, virtual_page, end, &mut counters);

        let mut run = PageRun {
            virtual_page,
            length,
            target,
            segment,
            updated_at: timestamp,
        };
        counters.apply(&run, true);

        if let Some((&key, left)) = runs.range(..virtual_page).next_back() {
            if left.continued_by(&run) {
                let mut merged = *left;
                merged.length += run.length;
                runs.remove(&key);
                run = merged;
            }
        }
        if let Some(right) = runs.get(&run.end()).copied() {
            if run.continued_by(&right) {
                runs.remove(&right.virtual_page);
                run.length += right.length;
            }
        }
        runs.insert(run.virtual_page, run);
        Ok(())
    }

    pub fn unmap(&mut self, process: ProcessId, virtual_page: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let end = range_end(virtual_page, length)?;
        let Some(runs) = self.processes.get_mut(&process) else {
            return Ok(());
        };
        let runs = Arc::make_mut(runs);
        let mut counters = Counters {
            process: self.mapped_pages.get_mut(&process),
            segments: Some(&mut self.segment_pages),
        };
        remove_range(runs, virtual_page, end, &mut counters);
        Ok(())
    }

    pub fn resolve(&self, process: ProcessId, virtual_page: u64) -> Option<(MappedTarget, SegmentId)> {
        let runs = self.processes.get(&process)?;
        let (_, run) = runs.range(..=virtual_page).next_back()?;
        if run.contains(virtual_page) {
            Some((run.target_at(virtual_page), run.segment))
        } else {
            None
        }
    }

    /// Runs intersecting `[virtual_page, virtual_page + length)`, clipped to it.
    pub fn runs_in(&self, process: ProcessId, virtual_page: u64, length: u64) -> Vec<PageRun> {
        let Some(runs) = self.processes.get(&process) else {
            return Vec::new();
        };
        let end = virtual_page.saturating_add(length);
        let mut out = Vec::new();
        if let Some((_, run)) = runs.range(..virtual_page).next_back() {
            if run.end() > virtual_page {
                out.push(run.clip(virtual_page, end));
            }
        }
        out.extend(
            runs.range(virtual_page..end)
                .map(|(_, run)| run.clip(virtual_page, end)),
        );
        out
    }

    pub fn runs(&self, process: ProcessId) -> impl Iterator<Item = &PageRun> {
        self.processes
            .get(&process)
            .into_iter()
            .flat_map(|runs| runs.values())
    }

    pub fn processes(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.processes.keys().copied()
    }

    pub fn run_count(&self) -> usize {
        self.processes.values().map(|runs| runs.len()).sum()
    }

    /// Pages of `process` mapped onto device or host memory.
    pub fn mapped_pages(&self, process: ProcessId) -> u64 {
        self.mapped_pages.get(&process).copied().unwrap_or(0)
    }

    /// Bytes of `process` mapped onto device or host memory.
    pub fn mapped_bytes(&self, process: ProcessId) -> Result<u64> {
        self.mapped_pages(process)
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| Error::malformed("committed bytes overflow"))
    }

    /// Several processes may map the same segment, so the sums saturate.
    pub fn mapped_bytes_per_segment(&self) -> [u64; MAX_SEGMENTS] {
        self.segment_pages.map(|pages| pages.saturating_mul(PAGE_SIZE))
    }

    pub fn total_mapped_pages(&self) -> u64 {
        self.mapped_pages
            .values()
            .fold(0u64, |total, pages| total.saturating_add(*pages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: ProcessId = 1;
    const SEG: SegmentId = SegmentId(0);

    fn runs(table: &PageTable) -> Vec<PageRun> {
        table.runs(P).copied().collect()
    }

    #[test]
    fn unmap_middle_splits_and_shifts_physical_base() -> Result<()> {
        let mut table = PageTable::new();
        table.map(P, 0, MappedTarget::Physical(0x8000_0000), 16, SEG, 5)?;
        table.unmap(P, 4, 4)?;
        let runs = runs(&table);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].virtual_page, runs[0].length), (0, 4));
        assert_eq!(runs[0].target, MappedTarget::Physical(0x8000_0000));
        assert_eq!((runs[1].virtual_page, runs[1].length), (8, 8));
        assert_eq!(runs[1].target, MappedTarget::Physical(0x8000_8000));
        assert_eq!(table.mapped_pages(P), 12);
        assert_eq!(table.mapped_bytes_per_segment()[0], 12 * PAGE_SIZE);
        Ok(())
    }

    #[test]
    fn contiguous_maps_with_same_time_coalesce() -> Result<()> {
        let mut table = PageTable::new();
        table.map(P, 0, MappedTarget::Physical(0x1000), 2, SEG, 7)?;
        table.map(P, 2, MappedTarget::Physical(0x3000), 2, SEG, 7)?;
        assert_eq!(runs(&table).len(), 1);
        assert_eq!(runs(&table)[0].length, 4);

        table.map(P, 4, MappedTarget::Physical(0x5000), 2, SEG, 8)?;
        assert_eq!(runs(&table).len(), 2);
        Ok(())
    }

    #[test]
    fn special_targets_never_coalesce() -> Result<()> {
        let mut table = PageTable::new();
        table.map(P, 0, MappedTarget::Invalid, 2, SegmentId::UNKNOWN, 1)?;
        table.map(P, 2, MappedTarget::Invalid, 2, SegmentId::UNKNOWN, 1)?;
        assert_eq!(runs(&table).len(), 2);
        assert_eq!(table.mapped_pages(P), 0);
        assert_eq!(
            table.resolve(P, 3),
            Some((MappedTarget::Invalid, SegmentId::UNKNOWN))
        );
        Ok(())
    }

    #[test]
    fn remap_overwrites_covered_range() -> Result<()> {
        let mut table = PageTable::new();
        table.map(P, 0, MappedTarget::Physical(0x10_0000), 8, SEG, 1)?;
        table.map(P, 2, MappedTarget::Physical(0x20_0000), 2, SegmentId(1), 2)?;
        assert_eq!(
            table.resolve(P, 3),
            Some((MappedTarget::Physical(0x20_1000), SegmentId(1)))
        );
        assert_eq!(
            table.resolve(P, 5),
            Some((MappedTarget::Physical(0x10_5000), SEG))
        );
        let runs = runs(&table);
        assert_eq!(runs.len(), 3);
        for pair in runs.windows(2) {
            assert!(pair[0].end() <= pair[1].virtual_page);
        }
        assert_eq!(table.mapped_pages(P), 8);
        Ok(())
    }

    #[test]
    fn host_runs_count_as_committed_but_stay_separate() -> Result<()> {
        let mut table = PageTable::new();
        table.map(P, 0, MappedTarget::Host, 2, SegmentId(2), 1)?;
        table.map(P, 2, MappedTarget::Host, 2, SegmentId(2), 1)?;
        assert_eq!(runs(&table).len(), 2);
        assert_eq!(table.mapped_pages(P), 4);
        assert_eq!(table.mapped_bytes_per_segment()[2], 4 * PAGE_SIZE);
        assert_eq!(table.resolve(P, 3), Some((MappedTarget::Host, SegmentId(2))));
        Ok(())
    }

    #[test]
    fn runs_in_clips_to_window() -> Result<()> {
        let mut table = PageTable::new();
        table.map(P, 10, MappedTarget::Physical(0xA000), 10, SEG, 1)?;
        let window = table.runs_in(P, 12, 3);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].virtual_page, 12);
        assert_eq!(window[0].length, 3);
        assert_eq!(window[0].target, MappedTarget::Physical(0xC000));
        assert!(table.runs_in(P, 0, 10).is_empty());
        assert_eq!(table.resolve(P, 20), None);
        Ok(())
    }

    #[test]
    fn page_ranges_past_the_address_space_are_rejected() -> Result<()> {
        let mut table = PageTable::new();
        assert!(matches!(
            table.map(P, 0, MappedTarget::Physical(0), 1 << 60, SEG, 1),
            Err(Error::MalformedTrace(_))
        ));
        assert!(matches!(
            table.unmap(P, MAX_PAGE, 1),
            Err(Error::MalformedTrace(_))
        ));
        assert_eq!(table.run_count(), 0);

        table.map(P, MAX_PAGE - 4, MappedTarget::Physical(0), 4, SEG, 2)?;
        assert_eq!(table.mapped_bytes(P)?, 4 * PAGE_SIZE);
        Ok(())
    }

    #[test]
    fn clone_is_isolated_from_later_updates() -> Result<()> {
        let mut table = PageTable::new();
        table.map(P, 0, MappedTarget::Physical(0), 4, SEG, 1)?;
        let frozen = table.clone();
        table.unmap(P, 0, 4)?;
        assert_eq!(frozen.run_count(), 1);
        assert_eq!(table.run_count(), 0);
        Ok(())
    }
}
