use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::warn;
use serde::Serialize;

use super::decoder::{StreamCursor, StreamDecoder};
use crate::cancel::CancelToken;
use crate::format::token::MemoryEvent;
use crate::types::Timestamp;
use crate::{Error, Result};

/// Committed position of every stream in a [`TokenHeap`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeapCursor {
    pub streams: Vec<StreamCursor>,
}

/// Entry in the merge heap.
#[derive(Debug, Eq, PartialEq)]
struct HeapEntry {
    timestamp: Timestamp,
    thread: u8,
    stream: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.thread.cmp(&other.thread))
            .then_with(|| self.stream.cmp(&other.stream))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges per-stream decoders into one stream ordered by
/// `(timestamp, thread id, stream index)`.
pub struct TokenHeap<'a> {
    decoders: Vec<StreamDecoder<'a>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    cancel: CancelToken,
    total_bytes: u64,
}

impl<'a> TokenHeap<'a> {
    pub fn new(streams: Vec<&'a [u8]>, cancel: CancelToken) -> Result<Self> {
        let decoders: Vec<StreamDecoder<'a>> = streams
            .into_iter()
            .enumerate()
            .map(|(index, bytes)| StreamDecoder::new(index, bytes))
            .collect();
        let total_bytes = decoders.iter().map(|d| d.len() as u64).sum();
        let mut heap = Self {
            heap: BinaryHeap::with_capacity(decoders.len()),
            decoders,
            cancel,
            total_bytes,
        };
        heap.prime()?;
        Ok(heap)
    }

    fn prime(&mut self) -> Result<()> {
        self.heap.clear();
        for stream in 0..self.decoders.len() {
            self.refill(stream)?;
        }
        Ok(())
    }

    /// Peeks the next token of `stream` and queues it.
    fn refill(&mut self, stream: usize) -> Result<()> {
        let Some(decoder) = self.decoders.get_mut(stream) else {
            return Ok(());
        };
        match decoder.peek() {
            Ok(Some(event)) => {
                self.heap.push(Reverse(HeapEntry {
                    timestamp: event.timestamp,
                    thread: event.thread,
                    stream,
                }));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(Error::TruncatedToken { stream, offset }) => {
                warn!("stream {stream} ends in a partial token at offset {offset}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Next event in global order, or `None` once every stream is drained.
    pub fn next(&mut self) -> Result<Option<MemoryEvent>> {
        self.cancel.check()?;
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        let event = self
            .decoders
            .get_mut(entry.stream)
            .and_then(StreamDecoder::advance)
            .ok_or_else(|| Error::malformed("merge heap entry without a decoded token"))?;
        self.refill(entry.stream)?;
        Ok(Some(event))
    }

    /// Timestamp of the next event without consuming it.
    pub fn peek_timestamp(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(entry)| entry.timestamp)
    }

    pub fn cursor(&self) -> HeapCursor {
        HeapCursor {
            streams: self.decoders.iter().map(StreamDecoder::cursor).collect(),
        }
    }

    /// Rewinds every stream to `cursor` and rebuilds the heap.
    pub fn seek(&mut self, cursor: &HeapCursor) -> Result<()> {
        if cursor.streams.len() != self.decoders.len() {
            return Err(Error::malformed(format!(
                "cursor covers {} streams, trace has {}",
                cursor.streams.len(),
                self.decoders.len()
            )));
        }
        for (decoder, position) in self.decoders.iter_mut().zip(&cursor.streams) {
            decoder.reset(*position);
        }
        self.prime()
    }

    pub fn stream_count(&self) -> usize {
        self.decoders.len()
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.decoders.iter().map(|d| d.position() as u64).sum()
    }

    pub fn bytes_total(&self) -> u64 {
        self.total_bytes
    }
}
