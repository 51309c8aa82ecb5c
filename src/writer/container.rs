//! Snapshots stored inside a container trace.
//!
//! The source trace is copied verbatim and a snapshot appends its
//! `SnapshotInfo`, a one-entry `SnapshotIndex` and one chunk per entity list,
//! all sharing the snapshot's ordinal as chunk index. Legacy sources are first
//! transcoded to the container layout.

use std::path::Path;

use log::info;

use crate::format::chunk::write_chunk;
use crate::format::trace_file::ChunkRecord;
use crate::format::{
    encode_snapshot_index, ChunkId, SnapshotIndexEntry, SnapshotInfo, TraceBuilder, TraceFile,
    TraceFormat,
};
use crate::snapshot::{ImageSection, Snapshot, SnapshotImage};
use crate::{Error, Result};

fn entity_chunk(section: ImageSection) -> Option<ChunkId> {
    match section {
        ImageSection::Processes => Some(ChunkId::SnapProcess),
        ImageSection::VirtualAllocations => Some(ChunkId::SnapVirtAlloc),
        ImageSection::PhysicalAllocations => Some(ChunkId::SnapPhysAlloc),
        ImageSection::Resources => Some(ChunkId::SnapResource),
        ImageSection::PageRuns => Some(ChunkId::SnapPageTable),
        ImageSection::Metadata | ImageSection::Segments => None,
    }
}

fn entity_section(id: ChunkId) -> Option<ImageSection> {
    ImageSection::ALL
        .into_iter()
        .find(|&section| entity_chunk(section) == Some(id))
}

/// Source bytes in the container layout.
fn container_bytes(source: &TraceFile) -> Vec<u8> {
    if source.format() == TraceFormat::Container {
        return source.bytes().to_vec();
    }
    let mut builder = TraceBuilder::container()
        .system(source.system.clone())
        .segments(source.segments.clone());
    if let Some(adapter) = &source.adapter {
        builder = builder.adapter(adapter.clone());
    }
    if let Some(events) = &source.driver_events {
        builder = builder.driver_events(events.clone());
    }
    for (index, stream) in source.streams().iter().enumerate() {
        builder = builder.raw_stream(
            stream.process,
            stream.thread,
            source.stream_bytes(index).to_vec(),
        );
    }
    for entry in &source.snapshot_index {
        builder = builder.snapshot_point(&entry.name, entry.timestamp);
    }
    builder.build()
}

/// Number of snapshots already stored in `trace`.
pub fn snapshot_count(trace: &TraceFile) -> usize {
    trace.snapshot_infos.len()
}

/// Chunks appended for one snapshot stored under `ordinal`.
pub fn encode_chunks(snapshot: &Snapshot, ordinal: u32) -> Vec<u8> {
    let image = snapshot.image();
    let info = SnapshotInfo {
        name: image.name.clone(),
        timestamp: image.timestamp,
        virtual_allocations: image.virtual_allocations.len() as u64,
        physical_allocations: image.physical_allocations.len() as u64,
        resources: image.resources.len() as u64,
        digest: image.digest(),
    };
    let mut out = Vec::new();
    write_chunk(&mut out, ChunkId::SnapshotInfo, ordinal, &info.encode());
    write_chunk(
        &mut out,
        ChunkId::SnapshotIndex,
        ordinal,
        &encode_snapshot_index(&[SnapshotIndexEntry {
            timestamp: image.timestamp,
            name: image.name.clone(),
        }]),
    );
    for section in ImageSection::ALL {
        if let Some(id) = entity_chunk(section) {
            write_chunk(&mut out, id, ordinal, &image.encode_section(section));
        }
    }
    out
}

/// Writes `source` plus `snapshot` to `path`. Returns the snapshot's ordinal.
pub fn write(path: &Path, source: &TraceFile, snapshot: &Snapshot) -> Result<u32> {
    let ordinal = u32::try_from(snapshot_count(source))
        .map_err(|_| Error::malformed("too many snapshots in container"))?;
    let base = container_bytes(source);
    let chunks = encode_chunks(snapshot, ordinal);
    super::write_atomic(path, &[&base, &chunks])?;
    info!(
        "stored snapshot {ordinal} ({:?} at {}) in {}",
        snapshot.name(),
        snapshot.timestamp(),
        path.display()
    );
    Ok(ordinal)
}

fn chunks_for(trace: &TraceFile, ordinal: u32) -> impl Iterator<Item = &ChunkRecord> {
    trace
        .chunks()
        .iter()
        .filter(move |record| record.header.index == ordinal)
}

/// Rebuilds the image of snapshot `ordinal` and checks it against the stored digest.
pub fn read(trace: &TraceFile, ordinal: u32) -> Result<SnapshotImage> {
    let info_record = chunks_for(trace, ordinal)
        .find(|record| record.header.id == ChunkId::SnapshotInfo)
        .ok_or_else(|| Error::malformed(format!("no snapshot {ordinal} in container")))?;
    let info = SnapshotInfo::decode(trace.chunk_payload(info_record))?;

    let mut image = SnapshotImage {
        name: info.name.clone(),
        timestamp: info.timestamp,
        segments: trace.segments.clone(),
        ..SnapshotImage::default()
    };
    for record in chunks_for(trace, ordinal) {
        if let Some(section) = entity_section(record.header.id) {
            image.decode_section(section, trace.chunk_payload(record))?;
        }
    }
    if image.digest() != info.digest {
        return Err(Error::malformed(format!(
            "snapshot {ordinal}: digest mismatch"
        )));
    }
    Ok(image)
}

pub fn read_all(trace: &TraceFile) -> Result<Vec<SnapshotImage>> {
    (0..snapshot_count(trace) as u32)
        .map(|ordinal| read(trace, ordinal))
        .collect()
}
