//! Trace file containers.
//!
//! Two layouts are accepted. The legacy layout is a fixed header followed by
//! length-prefixed per-thread streams and optional trailing chunks:
//!
//! ```text
//! b"RMTF" | u32 version | u32 stream count
//! per stream: u32 thread id | u64 length | token bytes
//! trailing chunks until end of file
//! ```
//!
//! The container layout is a short header followed by identified chunks, one
//! `RmtData` chunk per token stream:
//!
//! ```text
//! b"RDFC" | u32 version
//! chunks: [u8; 16] id | u32 index | u32 version | u64 length | payload
//! ```

use std::path::Path;

use log::{debug, info};

use super::chunk::{read_chunks, write_chunk, ChunkHeader, ChunkId};
use super::info::{
    decode_snapshot_index, encode_snapshot_index, AdapterInfo, DriverEventInfo, SegmentTable,
    SnapshotIndexEntry, SnapshotInfo, SystemInfo,
};
use super::token::TokenWriter;
use super::ByteReader;
use crate::mmap::TraceBytes;
use crate::{Error, Result};

pub const LEGACY_MAGIC: [u8; 4] = *b"RMTF";
pub const CONTAINER_MAGIC: [u8; 4] = *b"RDFC";
pub const LEGACY_VERSION: u32 = 1;
pub const CONTAINER_VERSION: u32 = 1;
pub const LEGACY_HEADER_LEN: usize = 12;
pub const CONTAINER_HEADER_LEN: usize = 8;
const RMT_DATA_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Legacy,
    Container,
}

/// Location of one token stream inside the trace bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceStream {
    pub process: u64,
    pub thread: u64,
    pub offset: usize,
    pub len: usize,
}

/// Location of one chunk inside the trace bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub header: ChunkHeader,
    pub payload_offset: usize,
}

impl ChunkRecord {
    pub fn header_offset(&self) -> usize {
        self.payload_offset - super::chunk::CHUNK_HEADER_LEN
    }

    pub fn end(&self) -> usize {
        self.payload_offset + self.header.length as usize
    }
}

/// A parsed trace: token stream locations plus decoded metadata chunks.
pub struct TraceFile {
    bytes: TraceBytes,
    format: TraceFormat,
    streams: Vec<TraceStream>,
    chunks: Vec<ChunkRecord>,
    pub adapter: Option<AdapterInfo>,
    pub system: SystemInfo,
    pub segments: SegmentTable,
    pub snapshot_index: Vec<SnapshotIndexEntry>,
    pub snapshot_infos: Vec<SnapshotInfo>,
    pub driver_events: Option<DriverEventInfo>,
}

impl TraceFile {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = TraceBytes::map(path)?;
        let trace = Self::parse(bytes)?;
        info!(
            "opened {} ({:?}, {} streams, {} bytes)",
            path.display(),
            trace.format,
            trace.streams.len(),
            trace.bytes.len()
        );
        Ok(trace)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(TraceBytes::Owned(bytes))
    }

    pub fn parse(bytes: TraceBytes) -> Result<Self> {
        let mut trace = Self {
            bytes,
            format: TraceFormat::Legacy,
            streams: Vec::new(),
            chunks: Vec::new(),
            adapter: None,
            system: SystemInfo::default(),
            segments: SegmentTable::default(),
            snapshot_index: Vec::new(),
            snapshot_infos: Vec::new(),
            driver_events: None,
        };
        let magic: [u8; 4] = ByteReader::new(&trace.bytes)
            .array()
            .map_err(|err| err.into_malformed("trace header"))?;
        let chunk_start = match magic {
            LEGACY_MAGIC => {
                trace.format = TraceFormat::Legacy;
                trace.parse_legacy_streams()?
            }
            CONTAINER_MAGIC => {
                trace.format = TraceFormat::Container;
                trace.parse_container_header()?
            }
            _ => return Err(Error::malformed("unrecognised trace magic")),
        };
        trace.parse_chunks(chunk_start)?;
        Ok(trace)
    }

    fn parse_legacy_streams(&mut self) -> Result<usize> {
        let mut reader = ByteReader::new(&self.bytes);
        let malformed = |err: super::ReadError| err.into_malformed("legacy header");
        reader.take(4).map_err(malformed)?;
        let version = reader.u32().map_err(malformed)?;
        let stream_count = reader.u32().map_err(malformed)?;
        if version != LEGACY_VERSION {
            return Err(Error::UnsupportedVersion {
                what: "legacy trace".to_string(),
                version,
            });
        }
        let mut streams = Vec::new();
        streams.try_reserve(stream_count as usize)?;
        for index in 0..stream_count {
            let what = format!("legacy stream {index}");
            let thread = reader.u32().map_err(|err| err.into_malformed(&what))?;
            let len = reader.u64().map_err(|err| err.into_malformed(&what))?;
            let len = usize::try_from(len).map_err(|_| Error::malformed("stream length overflow"))?;
            let offset = reader.position();
            reader.take(len).map_err(|err| err.into_malformed(&what))?;
            streams.push(TraceStream {
                process: 0,
                thread: thread as u64,
                offset,
                len,
            });
        }
        let end = reader.position();
        self.streams = streams;
        Ok(end)
    }

    fn parse_container_header(&mut self) -> Result<usize> {
        let mut reader = ByteReader::new(&self.bytes);
        reader
            .take(4)
            .map_err(|err| err.into_malformed("container header"))?;
        let version = reader
            .u32()
            .map_err(|err| err.into_malformed("container header"))?;
        if version != CONTAINER_VERSION {
            return Err(Error::UnsupportedVersion {
                what: "container".to_string(),
                version,
            });
        }
        Ok(CONTAINER_HEADER_LEN)
    }

    fn parse_chunks(&mut self, start: usize) -> Result<()> {
        let chunks = read_chunks(&self.bytes[start..], start)?;
        let mut records = Vec::with_capacity(chunks.len());
        let mut streams = Vec::new();
        for chunk in &chunks {
            chunk.header.check_version()?;
            match chunk.header.id {
                ChunkId::AsicInfo => self.adapter = Some(AdapterInfo::decode(chunk.payload)?),
                ChunkId::SystemInfo => self.system = SystemInfo::decode(chunk.payload)?,
                ChunkId::GpuMemSegmentInfo => {
                    self.segments = SegmentTable::decode(chunk.payload)?
                }
                ChunkId::SnapshotIndex => self
                    .snapshot_index
                    .extend(decode_snapshot_index(chunk.payload)?),
                ChunkId::SnapshotInfo => self
                    .snapshot_infos
                    .push(SnapshotInfo::decode(chunk.payload)?),
                ChunkId::DriverEventInfo => {
                    self.driver_events = Some(DriverEventInfo::decode(chunk.payload)?)
                }
                ChunkId::RmtData => {
                    if self.format == TraceFormat::Legacy {
                        return Err(Error::malformed("token data chunk in legacy trace"));
                    }
                    let mut reader = ByteReader::new(chunk.payload);
                    let process = reader
                        .u64()
                        .map_err(|err| err.into_malformed("rmt data"))?;
                    let thread = reader
                        .u64()
                        .map_err(|err| err.into_malformed("rmt data"))?;
                    streams.push(TraceStream {
                        process,
                        thread,
                        offset: chunk.offset + RMT_DATA_PREFIX_LEN,
                        len: chunk.payload.len() - RMT_DATA_PREFIX_LEN,
                    });
                }
                other => debug!("preserving chunk {}", other.name()),
            }
            records.push(ChunkRecord {
                header: chunk.header,
                payload_offset: chunk.offset,
            });
        }
        self.chunks = records;
        if self.format == TraceFormat::Container {
            self.streams = streams;
        }
        Ok(())
    }

    pub fn format(&self) -> TraceFormat {
        self.format
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn streams(&self) -> &[TraceStream] {
        &self.streams
    }

    pub fn stream_bytes(&self, index: usize) -> &[u8] {
        self.streams
            .get(index)
            .map_or(&[][..], |stream| {
                &self.bytes[stream.offset..stream.offset + stream.len]
            })
    }

    /// Sum of the token stream lengths; the denominator of parse progress.
    pub fn total_stream_bytes(&self) -> u64 {
        self.streams.iter().map(|stream| stream.len as u64).sum()
    }

    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    pub fn chunk_payload(&self, record: &ChunkRecord) -> &[u8] {
        &self.bytes[record.payload_offset..record.end()]
    }
}

/// Assembles trace files in either layout.
#[derive(Debug, Clone)]
pub struct TraceBuilder {
    format: TraceFormat,
    streams: Vec<(u64, u64, Vec<u8>)>,
    adapter: Option<AdapterInfo>,
    system: Option<SystemInfo>,
    segments: Option<SegmentTable>,
    snapshot_index: Vec<SnapshotIndexEntry>,
    driver_events: Option<DriverEventInfo>,
    extra_chunks: Vec<(ChunkId, Vec<u8>)>,
}

impl TraceBuilder {
    pub fn new(format: TraceFormat) -> Self {
        Self {
            format,
            streams: Vec::new(),
            adapter: None,
            system: None,
            segments: None,
            snapshot_index: Vec::new(),
            driver_events: None,
            extra_chunks: Vec::new(),
        }
    }

    pub fn legacy() -> Self {
        Self::new(TraceFormat::Legacy)
    }

    pub fn container() -> Self {
        Self::new(TraceFormat::Container)
    }

    pub fn stream(mut self, writer: TokenWriter) -> Self {
        let thread = writer.thread() as u64;
        self.streams.push((0, thread, writer.into_bytes()));
        self
    }

    pub fn raw_stream(mut self, process: u64, thread: u64, bytes: Vec<u8>) -> Self {
        self.streams.push((process, thread, bytes));
        self
    }

    pub fn adapter(mut self, adapter: AdapterInfo) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn system(mut self, system: SystemInfo) -> Self {
        self.system = Some(system);
        self
    }

    pub fn segments(mut self, segments: SegmentTable) -> Self {
        self.segments = Some(segments);
        self
    }

    pub fn snapshot_point(mut self, name: &str, timestamp: u64) -> Self {
        self.snapshot_index.push(SnapshotIndexEntry {
            timestamp,
            name: name.to_string(),
        });
        self
    }

    pub fn driver_events(mut self, info: DriverEventInfo) -> Self {
        self.driver_events = Some(info);
        self
    }

    pub fn chunk(mut self, id: ChunkId, payload: Vec<u8>) -> Self {
        self.extra_chunks.push((id, payload));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self.format {
            TraceFormat::Legacy => {
                out.extend_from_slice(&LEGACY_MAGIC);
                out.extend_from_slice(&LEGACY_VERSION.to_le_bytes());
                out.extend_from_slice(&(self.streams.len() as u32).to_le_bytes());
                for (_, thread, bytes) in &self.streams {
                    out.extend_from_slice(&(*thread as u32).to_le_bytes());
                    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                    out.extend_from_slice(bytes);
                }
            }
            TraceFormat::Container => {
                out.extend_from_slice(&CONTAINER_MAGIC);
                out.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
            }
        }
        if let Some(adapter) = &self.adapter {
            write_chunk(&mut out, ChunkId::AsicInfo, 0, &adapter.encode());
        }
        if let Some(system) = &self.system {
            write_chunk(&mut out, ChunkId::SystemInfo, 0, &system.encode());
        }
        if let Some(segments) = &self.segments {
            write_chunk(&mut out, ChunkId::GpuMemSegmentInfo, 0, &segments.encode());
        }
        if self.format == TraceFormat::Container {
            for (index, (process, thread, bytes)) in self.streams.iter().enumerate() {
                let mut payload = Vec::with_capacity(RMT_DATA_PREFIX_LEN + bytes.len());
                payload.extend_from_slice(&process.to_le_bytes());
                payload.extend_from_slice(&thread.to_le_bytes());
                payload.extend_from_slice(bytes);
                write_chunk(&mut out, ChunkId::RmtData, index as u32, &payload);
            }
        }
        if !self.snapshot_index.is_empty() {
            write_chunk(
                &mut out,
                ChunkId::SnapshotIndex,
                0,
                &encode_snapshot_index(&self.snapshot_index),
            );
        }
        if let Some(info) = &self.driver_events {
            write_chunk(&mut out, ChunkId::DriverEventInfo, 0, &info.encode());
        }
        for (index, (id, payload)) in self.extra_chunks.iter().enumerate() {
            write_chunk(&mut out, *id, index as u32, payload);
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        crate::writer::write_atomic(path, &[&self.build()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::token::Token;
    use crate::format::SegmentInfo;
    use crate::types::{MiscKind, SegmentKind};

    fn writer(thread: u8) -> TokenWriter {
        let mut writer = TokenWriter::new(thread);
        writer.push(10, &Token::Misc(MiscKind::Present));
        writer
    }

    #[test]
    fn legacy_streams_located() -> Result<()> {
        let bytes = TraceBuilder::legacy()
            .stream(writer(1))
            .stream(writer(2))
            .build();
        let trace = TraceFile::from_bytes(bytes)?;
        assert_eq!(trace.format(), TraceFormat::Legacy);
        assert_eq!(trace.streams().len(), 2);
        assert_eq!(trace.streams()[1].thread, 2);
        assert_eq!(trace.stream_bytes(0), writer(1).as_bytes());
        Ok(())
    }

    #[test]
    fn container_metadata_decoded() -> Result<()> {
        let segments = SegmentTable::new(vec![SegmentInfo {
            base_address: 0x8000_0000,
            size: 1 << 30,
            kind: SegmentKind::Local,
            memory_index: 0,
        }])?;
        let bytes = TraceBuilder::container()
            .segments(segments.clone())
            .stream(writer(4))
            .snapshot_point("frame 10", 10)
            .chunk(ChunkId::Other(*b"VendorBlob\0\0\0\0\0\0"), vec![9, 9])
            .build();
        let trace = TraceFile::from_bytes(bytes)?;
        assert_eq!(trace.format(), TraceFormat::Container);
        assert_eq!(trace.segments, segments);
        assert_eq!(trace.streams().len(), 1);
        assert_eq!(trace.stream_bytes(0), writer(4).as_bytes());
        assert_eq!(trace.snapshot_index[0].name, "frame 10");
        let vendor = trace
            .chunks()
            .iter()
            .find(|record| !record.header.id.is_known())
            .map(|record| trace.chunk_payload(record).to_vec());
        assert_eq!(vendor, Some(vec![9, 9]));
        Ok(())
    }

    #[test]
    fn bad_magic_is_malformed() {
        assert!(matches!(
            TraceFile::from_bytes(b"NOPE\x01\0\0\0".to_vec()),
            Err(Error::MalformedTrace(_))
        ));
    }

    #[test]
    fn future_legacy_version_unsupported() {
        let mut bytes = TraceBuilder::legacy().build();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            TraceFile::from_bytes(bytes),
            Err(Error::UnsupportedVersion { version: 7, .. })
        ));
    }

    #[test]
    fn short_stream_length_is_malformed() {
        let mut bytes = TraceBuilder::legacy().stream(writer(0)).build();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            TraceFile::from_bytes(bytes),
            Err(Error::MalformedTrace(_))
        ));
    }
}
