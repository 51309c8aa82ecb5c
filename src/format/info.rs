//! Metadata chunk payloads.

use serde::{Deserialize, Serialize};

use super::{put_str, put_u32, put_u64, put_u8, ByteReader, ReadResult};
use crate::types::{
    Address, SegmentId, SegmentKind, Timestamp, DEFAULT_TIMESTAMP_FREQUENCY, MAX_SEGMENTS,
};
use crate::{Error, Result};

fn finish<T>(what: &str, result: ReadResult<T>) -> Result<T> {
    result.map_err(|err| err.into_malformed(what))
}

/// Adapter description carried by the `AsicInfo` chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub name: String,
    pub pcie_family_id: u32,
    pub pcie_revision_id: u32,
    pub device_id: u32,
    pub min_engine_clock_mhz: u32,
    pub max_engine_clock_mhz: u32,
    pub memory_type: u32,
    pub memory_ops_per_clock: u32,
    pub memory_bus_width: u32,
    pub memory_bandwidth_mbps: u32,
    pub min_memory_clock_mhz: u32,
    pub max_memory_clock_mhz: u32,
}

impl AdapterInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.name);
        for value in [
            self.pcie_family_id,
            self.pcie_revision_id,
            self.device_id,
            self.min_engine_clock_mhz,
            self.max_engine_clock_mhz,
            self.memory_type,
            self.memory_ops_per_clock,
            self.memory_bus_width,
            self.memory_bandwidth_mbps,
            self.min_memory_clock_mhz,
            self.max_memory_clock_mhz,
        ] {
            put_u32(&mut out, value);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        finish("adapter info", Self::read(&mut reader))
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            name: reader.string()?,
            pcie_family_id: reader.u32()?,
            pcie_revision_id: reader.u32()?,
            device_id: reader.u32()?,
            min_engine_clock_mhz: reader.u32()?,
            max_engine_clock_mhz: reader.u32()?,
            memory_type: reader.u32()?,
            memory_ops_per_clock: reader.u32()?,
            memory_bus_width: reader.u32()?,
            memory_bandwidth_mbps: reader.u32()?,
            min_memory_clock_mhz: reader.u32()?,
            max_memory_clock_mhz: reader.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub vendor: String,
    pub processor_brand: String,
    /// Trace clock frequency in Hz.
    pub timestamp_frequency: u64,
    pub clock_speed_mhz: u32,
    pub logical_cores: u32,
    pub physical_cores: u32,
    pub system_ram_mb: u32,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            vendor: String::new(),
            processor_brand: String::new(),
            timestamp_frequency: DEFAULT_TIMESTAMP_FREQUENCY,
            clock_speed_mhz: 0,
            logical_cores: 0,
            physical_cores: 0,
            system_ram_mb: 0,
        }
    }
}

impl SystemInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.vendor);
        put_str(&mut out, &self.processor_brand);
        put_u64(&mut out, self.timestamp_frequency);
        put_u32(&mut out, self.clock_speed_mhz);
        put_u32(&mut out, self.logical_cores);
        put_u32(&mut out, self.physical_cores);
        put_u32(&mut out, self.system_ram_mb);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let info = finish("system info", Self::read(&mut reader))?;
        if info.timestamp_frequency == 0 {
            return Err(Error::malformed("system info: zero timestamp frequency"));
        }
        Ok(info)
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            vendor: reader.string()?,
            processor_brand: reader.string()?,
            timestamp_frequency: reader.u64()?,
            clock_speed_mhz: reader.u32()?,
            logical_cores: reader.u32()?,
            physical_cores: reader.u32()?,
            system_ram_mb: reader.u32()?,
        })
    }

    /// Converts a tick count into nanoseconds.
    pub fn ticks_to_nanos(&self, ticks: Timestamp) -> u64 {
        let nanos = ticks as u128 * 1_000_000_000u128 / self.timestamp_frequency.max(1) as u128;
        nanos.min(u64::MAX as u128) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub base_address: Address,
    pub size: u64,
    pub kind: SegmentKind,
    pub memory_index: u32,
}

impl SegmentInfo {
    pub fn end_address(&self) -> Address {
        self.base_address.saturating_add(self.size)
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base_address && address < self.end_address()
    }
}

/// Immutable segment layout of the traced adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTable {
    segments: Vec<SegmentInfo>,
}

impl SegmentTable {
    pub fn new(segments: Vec<SegmentInfo>) -> Result<Self> {
        if segments.len() > MAX_SEGMENTS {
            return Err(Error::malformed(format!(
                "{} segments exceeds the limit of {MAX_SEGMENTS}",
                segments.len()
            )));
        }
        Ok(Self { segments })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, id: SegmentId) -> Option<&SegmentInfo> {
        self.segments.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SegmentId, &SegmentInfo)> {
        self.segments
            .iter()
            .enumerate()
            .map(|(index, info)| (SegmentId(index as u8), info))
    }

    pub fn kind(&self, id: SegmentId) -> Option<SegmentKind> {
        self.get(id).map(|info| info.kind)
    }

    /// Segment holding `address`. Physical address zero denotes host memory and
    /// resolves to the first host-visible segment.
    pub fn segment_for_address(&self, address: Address) -> SegmentId {
        if address == 0 {
            return self
                .iter()
                .find(|(_, info)| info.kind == SegmentKind::HostVisible)
                .map_or(SegmentId::UNKNOWN, |(id, _)| id);
        }
        self.iter()
            .find(|(_, info)| info.contains(address))
            .map_or(SegmentId::UNKNOWN, |(id, _)| id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.segments.len() as u32);
        for segment in &self.segments {
            put_u64(&mut out, segment.base_address);
            put_u64(&mut out, segment.size);
            put_u8(&mut out, segment.kind.as_u8());
            put_u32(&mut out, segment.memory_index);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let count = finish("segment info", reader.u32())? as usize;
        if count > MAX_SEGMENTS {
            return Err(Error::malformed(format!(
                "{count} segments exceeds the limit of {MAX_SEGMENTS}"
            )));
        }
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let base_address = finish("segment info", reader.u64())?;
            let size = finish("segment info", reader.u64())?;
            let raw_kind = finish("segment info", reader.u8())?;
            let kind = SegmentKind::from_u8(raw_kind)
                .ok_or_else(|| Error::malformed(format!("unknown segment kind {raw_kind}")))?;
            let memory_index = finish("segment info", reader.u32())?;
            segments.push(SegmentInfo {
                base_address,
                size,
                kind,
                memory_index,
            });
        }
        Self::new(segments)
    }
}

/// Named timestamp listed by the `SnapshotIndex` chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIndexEntry {
    pub timestamp: Timestamp,
    pub name: String,
}

pub fn encode_snapshot_index(entries: &[SnapshotIndexEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, entries.len() as u32);
    for entry in entries {
        put_u64(&mut out, entry.timestamp);
        put_str(&mut out, &entry.name);
    }
    out
}

pub fn decode_snapshot_index(bytes: &[u8]) -> Result<Vec<SnapshotIndexEntry>> {
    let mut reader = ByteReader::new(bytes);
    let count = finish("snapshot index", reader.u32())? as usize;
    let mut entries = Vec::new();
    entries.try_reserve(count.min(reader.remaining()))?;
    for _ in 0..count {
        entries.push(SnapshotIndexEntry {
            timestamp: finish("snapshot index", reader.u64())?,
            name: finish("snapshot index", reader.string())?,
        });
    }
    Ok(entries)
}

/// Per-snapshot metadata carried by the `SnapshotInfo` chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub timestamp: Timestamp,
    pub virtual_allocations: u64,
    pub physical_allocations: u64,
    pub resources: u64,
    pub digest: [u8; 32],
}

impl SnapshotInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u64(&mut out, self.timestamp);
        put_str(&mut out, &self.name);
        put_u64(&mut out, self.virtual_allocations);
        put_u64(&mut out, self.physical_allocations);
        put_u64(&mut out, self.resources);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        finish("snapshot info", Self::read(&mut reader))
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            timestamp: reader.u64()?,
            name: reader.string()?,
            virtual_allocations: reader.u64()?,
            physical_allocations: reader.u64()?,
            resources: reader.u64()?,
            digest: reader.array()?,
        })
    }
}

/// Driver event metadata carried by the `DriverEventInfo` chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEventInfo {
    pub version_major: u32,
    pub version_minor: u32,
    pub description: String,
}

impl DriverEventInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.version_major);
        put_u32(&mut out, self.version_minor);
        put_str(&mut out, &self.description);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        finish("driver event info", Self::read(&mut reader))
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            version_major: reader.u32()?,
            version_minor: reader.u32()?,
            description: reader.string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SegmentTable {
        SegmentTable::new(vec![
            SegmentInfo {
                base_address: 0x8000_0000,
                size: 0x1000_0000,
                kind: SegmentKind::Local,
                memory_index: 0,
            },
            SegmentInfo {
                base_address: 0x1_0000_0000,
                size: 0x1000_0000,
                kind: SegmentKind::HostVisible,
                memory_index: 1,
            },
        ])
        .unwrap()
    }

    #[test]
    fn address_lookup_finds_containing_segment() {
        let table = table();
        assert_eq!(table.segment_for_address(0x8000_1000), SegmentId(0));
        assert_eq!(table.segment_for_address(0x1_0000_0000), SegmentId(1));
        assert_eq!(table.segment_for_address(0x4000), SegmentId::UNKNOWN);
    }

    #[test]
    fn physical_zero_is_host_memory() {
        assert_eq!(table().segment_for_address(0), SegmentId(1));
        assert_eq!(
            SegmentTable::default().segment_for_address(0),
            SegmentId::UNKNOWN
        );
    }

    #[test]
    fn seventeen_segments_rejected() {
        let segment = SegmentInfo {
            base_address: 0,
            size: 1,
            kind: SegmentKind::Local,
            memory_index: 0,
        };
        assert!(matches!(
            SegmentTable::new(vec![segment; MAX_SEGMENTS + 1]),
            Err(Error::MalformedTrace(_))
        ));
    }

    #[test]
    fn system_info_rejects_zero_frequency() {
        let info = SystemInfo {
            timestamp_frequency: 0,
            ..SystemInfo::default()
        };
        assert!(SystemInfo::decode(&info.encode()).is_err());
    }

    #[test]
    fn ticks_convert_with_trace_frequency() {
        let info = SystemInfo {
            timestamp_frequency: 100_000_000,
            ..SystemInfo::default()
        };
        assert_eq!(info.ticks_to_nanos(250), 2_500);
    }
}
