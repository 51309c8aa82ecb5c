use super::ByteReader;
use crate::{Error, Result};

pub const CHUNK_ID_LEN: usize = 16;
pub const CHUNK_HEADER_LEN: usize = 32;
/// Schema version written for every chunk this crate produces.
pub const CHUNK_VERSION: u32 = 1;

/// Chunk identifier: ASCII, NUL padded to 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkId {
    AsicInfo,
    SystemInfo,
    GpuMemSegmentInfo,
    RmtData,
    SnapshotIndex,
    SnapshotInfo,
    DriverEventInfo,
    SnapVirtAlloc,
    SnapPhysAlloc,
    SnapResource,
    SnapPageTable,
    SnapProcess,
    Other([u8; CHUNK_ID_LEN]),
}

const KNOWN: [(ChunkId, &str); 12] = [
    (ChunkId::AsicInfo, "AsicInfo"),
    (ChunkId::SystemInfo, "SystemInfo"),
    (ChunkId::GpuMemSegmentInfo, "GpuMemSegmentInfo"),
    (ChunkId::RmtData, "RmtData"),
    (ChunkId::SnapshotIndex, "SnapshotIndex"),
    (ChunkId::SnapshotInfo, "SnapshotInfo"),
    (ChunkId::DriverEventInfo, "DriverEventInfo"),
    (ChunkId::SnapVirtAlloc, "SnapVirtAlloc"),
    (ChunkId::SnapPhysAlloc, "SnapPhysAlloc"),
    (ChunkId::SnapResource, "SnapResource"),
    (ChunkId::SnapPageTable, "SnapPageTable"),
    (ChunkId::SnapProcess, "SnapProcess"),
];

impl ChunkId {
    pub fn name(&self) -> String {
        match self {
            ChunkId::Other(raw) => {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(CHUNK_ID_LEN);
                String::from_utf8_lossy(&raw[..end]).into_owned()
            }
            known => KNOWN
                .iter()
                .find(|(id, _)| id == known)
                .map(|(_, name)| (*name).to_string())
                .unwrap_or_default(),
        }
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_ID_LEN] {
        if let ChunkId::Other(raw) = self {
            return *raw;
        }
        let name = self.name();
        let mut raw = [0u8; CHUNK_ID_LEN];
        let len = name.len().min(CHUNK_ID_LEN);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        raw
    }

    pub fn from_bytes(raw: [u8; CHUNK_ID_LEN]) -> Self {
        KNOWN
            .iter()
            .find(|(id, _)| id.to_bytes() == raw)
            .map(|(id, _)| *id)
            .unwrap_or(ChunkId::Other(raw))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ChunkId::Other(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: ChunkId,
    pub index: u32,
    pub version: u32,
    pub length: u64,
}

impl ChunkHeader {
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];
        buf[0..16].copy_from_slice(&self.id.to_bytes());
        buf[16..20].copy_from_slice(&self.index.to_le_bytes());
        buf[20..24].copy_from_slice(&self.version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; CHUNK_HEADER_LEN]) -> Self {
        let mut raw = [0u8; CHUNK_ID_LEN];
        raw.copy_from_slice(&bytes[0..16]);
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[16..20]);
        let index = u32::from_le_bytes(word);
        word.copy_from_slice(&bytes[20..24]);
        let version = u32::from_le_bytes(word);
        let mut long = [0u8; 8];
        long.copy_from_slice(&bytes[24..32]);
        Self {
            id: ChunkId::from_bytes(raw),
            index,
            version,
            length: u64::from_le_bytes(long),
        }
    }

    /// Known chunks must carry a version this crate understands.
    pub fn check_version(&self) -> Result<()> {
        if self.id.is_known() && self.version != CHUNK_VERSION {
            return Err(Error::UnsupportedVersion {
                what: self.id.name(),
                version: self.version,
            });
        }
        Ok(())
    }
}

/// A chunk borrowed from a trace buffer.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub header: ChunkHeader,
    /// Offset of the payload in the enclosing buffer.
    pub offset: usize,
    pub payload: &'a [u8],
}

/// Splits a byte range into chunks until it is exhausted.
pub fn read_chunks(bytes: &[u8], base_offset: usize) -> Result<Vec<Chunk<'_>>> {
    let mut reader = ByteReader::new(bytes);
    let mut chunks = Vec::new();
    while reader.remaining() > 0 {
        let raw: [u8; CHUNK_HEADER_LEN] = reader
            .array()
            .map_err(|err| err.into_malformed("chunk header"))?;
        let header = ChunkHeader::from_bytes(&raw);
        let len = usize::try_from(header.length)
            .map_err(|_| Error::malformed("chunk length overflow"))?;
        let offset = base_offset + reader.position();
        let payload = reader
            .take(len)
            .map_err(|err| err.into_malformed(&format!("chunk {}", header.id.name())))?;
        chunks.push(Chunk {
            header,
            offset,
            payload,
        });
    }
    Ok(chunks)
}

pub fn write_chunk(out: &mut Vec<u8>, id: ChunkId, index: u32, payload: &[u8]) {
    let header = ChunkHeader {
        id,
        index,
        version: CHUNK_VERSION,
        length: payload.len() as u64,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_nul_padded_ascii() {
        let raw = ChunkId::GpuMemSegmentInfo.to_bytes();
        assert_eq!(&raw, b"GpuMemSegmentInf");
        assert_eq!(ChunkId::from_bytes(raw), ChunkId::GpuMemSegmentInfo);
        assert_eq!(&ChunkId::RmtData.to_bytes()[..8], b"RmtData\0");
    }

    #[test]
    fn unknown_identifier_preserved() {
        let mut raw = [0u8; CHUNK_ID_LEN];
        raw[..6].copy_from_slice(b"Vendor");
        let id = ChunkId::from_bytes(raw);
        assert_eq!(id, ChunkId::Other(raw));
        assert_eq!(id.name(), "Vendor");
        assert_eq!(id.to_bytes(), raw);
    }

    #[test]
    fn known_chunk_with_future_version_rejected() {
        let header = ChunkHeader {
            id: ChunkId::SystemInfo,
            index: 0,
            version: 9,
            length: 0,
        };
        assert!(matches!(
            header.check_version(),
            Err(Error::UnsupportedVersion { version: 9, .. })
        ));
        let other = ChunkHeader {
            id: ChunkId::Other([b'x'; CHUNK_ID_LEN]),
            ..header
        };
        assert!(other.check_version().is_ok());
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut out = Vec::new();
        write_chunk(&mut out, ChunkId::RmtData, 0, &[1, 2, 3, 4]);
        out.truncate(out.len() - 1);
        assert!(matches!(read_chunks(&out, 0), Err(Error::MalformedTrace(_))));
    }
}
