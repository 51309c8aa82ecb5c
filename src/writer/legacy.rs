//! Standalone snapshot blob.
//!
//! Layout: `b"RMTS"`, `u32` schema version, `u32` chunk count, then per chunk
//! `u32` section kind, `u32` crc32 of the payload, `u64` payload length and the
//! payload. Unknown section kinds are skipped on read.

use std::path::Path;

use log::debug;

use crate::format::{ByteReader, ReadError};
use crate::snapshot::{ImageSection, Snapshot, SnapshotImage, IMAGE_SCHEMA_VERSION};
use crate::{Error, Result};

pub const MAGIC: [u8; 4] = *b"RMTS";
const CHUNK_HEADER_LEN: usize = 16;

pub fn encode(image: &SnapshotImage) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&IMAGE_SCHEMA_VERSION.to_le_bytes());
    out.extend_from_slice(&(ImageSection::ALL.len() as u32).to_le_bytes());
    for section in ImageSection::ALL {
        let payload = image.encode_section(section);
        out.reserve(CHUNK_HEADER_LEN + payload.len());
        out.extend_from_slice(&section.as_u32().to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&payload);
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<SnapshotImage> {
    let mut reader = ByteReader::new(bytes);
    let header = |err: ReadError| err.into_malformed("snapshot header");
    let magic: [u8; 4] = reader.array().map_err(header)?;
    if magic != MAGIC {
        return Err(Error::malformed("not a snapshot file"));
    }
    let version = reader.u32().map_err(header)?;
    if version != IMAGE_SCHEMA_VERSION {
        return Err(Error::UnsupportedVersion {
            what: "snapshot".to_string(),
            version,
        });
    }
    let count = reader.u32().map_err(header)?;

    let mut image = SnapshotImage::default();
    for index in 0..count {
        let chunk = |err: ReadError| err.into_malformed(&format!("snapshot chunk {index}"));
        let kind = reader.u32().map_err(chunk)?;
        let crc = reader.u32().map_err(chunk)?;
        let len = usize::try_from(reader.u64().map_err(chunk)?)
            .map_err(|_| Error::malformed("snapshot chunk length overflow"))?;
        let payload = reader.take(len).map_err(chunk)?;
        if crc32fast::hash(payload) != crc {
            return Err(Error::malformed(format!(
                "snapshot chunk {index}: checksum mismatch"
            )));
        }
        match ImageSection::from_u32(kind) {
            Some(section) => image.decode_section(section, payload)?,
            None => debug!("skipping snapshot chunk kind {kind}"),
        }
    }
    if reader.remaining() != 0 {
        return Err(Error::malformed("trailing bytes after snapshot chunks"));
    }
    Ok(image)
}

pub fn write(path: &Path, snapshot: &Snapshot) -> Result<()> {
    super::write_atomic(path, &[&encode(&snapshot.image())])
}

pub fn read(path: &Path) -> Result<SnapshotImage> {
    decode(&std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{SegmentInfo, SegmentTable};
    use crate::snapshot::image::ImageProcess;
    use crate::types::SegmentKind;

    fn image() -> SnapshotImage {
        SnapshotImage {
            name: "frame".into(),
            timestamp: 77,
            segments: SegmentTable::new(vec![SegmentInfo {
                base_address: 0x8000_0000,
                size: 0x100_0000,
                kind: SegmentKind::Invisible,
                memory_index: 2,
            }])
            .unwrap(),
            processes: vec![ImageProcess {
                id: 9,
                name: None,
                committed_bytes: 4096,
                virtual_allocations: 0,
            }],
            ..SnapshotImage::default()
        }
    }

    #[test]
    fn flipped_payload_bit_fails_checksum() {
        let mut bytes = encode(&image());
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert!(matches!(decode(&bytes), Err(Error::MalformedTrace(_))));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut bytes = encode(&image());
        bytes[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(Error::UnsupportedVersion { version: 9, .. })
        ));
    }

    #[test]
    fn decodes_what_it_encodes() {
        let original = image();
        assert_eq!(decode(&encode(&original)).unwrap(), original);
    }
}
