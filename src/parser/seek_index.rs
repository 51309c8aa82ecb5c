//! Sparse timestamp index built during the first full pass.
//!
//! Every `stride` events the builder records the merge heap cursor together
//! with the last applied timestamp. Every `checkpoint_interval`-th entry also
//! holds a copy-on-write clone of the live state, so a replay can restart
//! there instead of at the beginning of the trace.

use std::sync::Arc;

use super::merge::{HeapCursor, TokenHeap};
use crate::state::LiveState;
use crate::types::Timestamp;
use crate::Result;

#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Timestamp of the last event applied before this entry.
    pub timestamp: Timestamp,
    /// Number of events applied before this entry.
    pub ordinal: u64,
    pub cursor: HeapCursor,
    pub checkpoint: Option<Arc<LiveState>>,
}

#[derive(Debug, Clone, Default)]
pub struct SeekIndex {
    stride: u64,
    entries: Vec<IndexEntry>,
}

impl SeekIndex {
    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.checkpoint.is_some())
            .count()
    }

    /// Last entry whose timestamp is `<= timestamp`.
    pub fn entry_at_or_before(&self, timestamp: Timestamp) -> Option<&IndexEntry> {
        let end = self
            .entries
            .partition_point(|entry| entry.timestamp <= timestamp);
        end.checked_sub(1).and_then(|index| self.entries.get(index))
    }

    /// Last checkpointed entry whose timestamp is `<= timestamp`.
    pub fn checkpoint_at_or_before(&self, timestamp: Timestamp) -> Option<&IndexEntry> {
        let end = self
            .entries
            .partition_point(|entry| entry.timestamp <= timestamp);
        self.entries[..end]
            .iter()
            .rev()
            .find(|entry| entry.checkpoint.is_some())
    }
}

pub struct SeekIndexBuilder {
    stride: u64,
    checkpoint_interval: u64,
    next_entry_at: u64,
    entries: Vec<IndexEntry>,
}

impl SeekIndexBuilder {
    pub fn new(stride: u64, checkpoint_interval: u64) -> Self {
        Self {
            stride: stride.max(1),
            checkpoint_interval: checkpoint_interval.max(1),
            next_entry_at: 0,
            entries: Vec::new(),
        }
    }

    /// Whether [`observe`](Self::observe) at `ordinal` will store a state copy.
    pub fn checkpoint_due(&self, ordinal: u64) -> bool {
        ordinal == self.next_entry_at
            && self.entries.len() as u64 % self.checkpoint_interval == 0
    }

    /// Called before each event is applied, with `state` reflecting every
    /// earlier event and `heap` positioned on the event about to be applied.
    pub fn observe(&mut self, heap: &TokenHeap<'_>, state: &LiveState) -> Result<()> {
        if state.ordinal != self.next_entry_at {
            return Ok(());
        }
        let checkpoint = self
            .checkpoint_due(state.ordinal)
            .then(|| Arc::new(state.clone()));
        self.entries.try_reserve(1)?;
        self.entries.push(IndexEntry {
            timestamp: state.timestamp,
            ordinal: state.ordinal,
            cursor: heap.cursor(),
            checkpoint,
        });
        self.next_entry_at = self.next_entry_at.saturating_add(self.stride);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> SeekIndex {
        SeekIndex {
            stride: self.stride,
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::DuplicateResourcePolicy;
    use crate::format::{SegmentTable, Token, TokenWriter};
    use crate::state::ApplyContext;
    use crate::types::MiscKind;

    fn build(stride: u64, interval: u64, stamps: &[Timestamp]) -> SeekIndex {
        let mut writer = TokenWriter::new(0);
        for &t in stamps {
            writer.push(t, &Token::Misc(MiscKind::Present));
        }
        let bytes = writer.into_bytes();
        let mut heap = TokenHeap::new(vec![bytes.as_slice()], CancelToken::new()).unwrap();
        let segments = SegmentTable::default();
        let ctx = ApplyContext {
            segments: &segments,
            policy: DuplicateResourcePolicy::KeepFirst,
        };
        let mut state = LiveState::new();
        let mut builder = SeekIndexBuilder::new(stride, interval);
        loop {
            builder.observe(&heap, &state).unwrap();
            let Some(event) = heap.next().unwrap() else {
                break;
            };
            state.apply(&event, &ctx).unwrap();
        }
        builder.finish()
    }

    #[test]
    fn entries_every_stride_with_sparse_checkpoints() {
        let stamps: Vec<Timestamp> = (1..=10).map(|i| i * 10).collect();
        let index = build(3, 2, &stamps);
        let ordinals: Vec<u64> = index.entries().iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 3, 6, 9]);
        assert_eq!(index.checkpoint_count(), 2);
        assert_eq!(index.entries()[1].timestamp, 30);
        assert!(index.entries()[2].checkpoint.is_some());
    }

    #[test]
    fn lookup_prefers_latest_checkpoint_not_after_target() {
        let stamps: Vec<Timestamp> = (1..=10).map(|i| i * 10).collect();
        let index = build(3, 2, &stamps);
        let entry = index.checkpoint_at_or_before(95).unwrap();
        assert_eq!(entry.ordinal, 6);
        assert_eq!(index.entry_at_or_before(95).unwrap().ordinal, 9);
        assert_eq!(index.checkpoint_at_or_before(0).unwrap().ordinal, 0);
        let state = entry.checkpoint.as_ref().unwrap();
        assert_eq!(state.timestamp, 60);
        assert_eq!(state.misc_counts[MiscKind::Present.as_u8() as usize], 6);
    }
}
