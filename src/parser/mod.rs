//! Streaming token decode: per-stream decoders, the merge heap and the
//! timestamp index recorded while building.

pub mod decoder;
pub mod merge;
pub mod seek_index;

pub use decoder::{StreamCursor, StreamDecoder};
pub use merge::{HeapCursor, TokenHeap};
pub use seek_index::{IndexEntry, SeekIndex, SeekIndexBuilder};

use crate::cancel::CancelToken;
use crate::format::TraceFile;
use crate::Result;

/// Merge heap over every token stream of `trace`.
pub fn open_heap(trace: &TraceFile, cancel: CancelToken) -> Result<TokenHeap<'_>> {
    let streams = (0..trace.streams().len())
        .map(|index| trace.stream_bytes(index))
        .collect();
    TokenHeap::new(streams, cancel)
}
