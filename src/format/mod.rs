//! On-disk encodings: tokens, container chunks, info payloads and whole trace files.

pub mod chunk;
pub mod info;
pub mod token;
pub mod trace_file;

pub use chunk::{ChunkHeader, ChunkId};
pub use info::{
    encode_snapshot_index, AdapterInfo, DriverEventInfo, SegmentInfo, SegmentTable,
    SnapshotIndexEntry, SnapshotInfo, SystemInfo,
};
pub use token::{MemoryEvent, Token, TokenKind, TokenWriter};
pub use trace_file::{TraceBuilder, TraceFile, TraceFormat, TraceStream};

use crate::Error;

/// Failure while reading a fixed-width field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadError {
    Short,
    Invalid(&'static str),
}

impl ReadError {
    pub(crate) fn into_malformed(self, what: &str) -> Error {
        match self {
            ReadError::Short => Error::malformed(format!("{what}: truncated")),
            ReadError::Invalid(reason) => Error::malformed(format!("{what}: {reason}")),
        }
    }
}

pub(crate) type ReadResult<T> = std::result::Result<T, ReadError>;

/// Little-endian cursor over a borrowed byte slice.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> ReadResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(ReadError::Short)?;
        if end > self.bytes.len() {
            return Err(ReadError::Short);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> ReadResult<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> ReadResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> ReadResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> ReadResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn bool(&mut self) -> ReadResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ReadError::Invalid("boolean out of range")),
        }
    }

    /// `u16` length followed by UTF-8 bytes.
    pub(crate) fn string(&mut self) -> ReadResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ReadError::Invalid("string is not utf-8"))
    }
}

pub(crate) fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Strings longer than `u16::MAX` bytes are cut at the last char boundary that fits.
pub(crate) fn put_str(out: &mut Vec<u8>, value: &str) {
    let mut end = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    put_u16(out, end as u16);
    out.extend_from_slice(&value.as_bytes()[..end]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_short_reads() {
        let mut reader = ByteReader::new(&[1, 0, 2]);
        assert_eq!(reader.u16(), Ok(1));
        assert_eq!(reader.u16(), Err(ReadError::Short));
        assert_eq!(reader.u8(), Ok(2));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn strings_carry_length_prefix() {
        let mut out = Vec::new();
        put_str(&mut out, "héap");
        let mut reader = ByteReader::new(&out);
        assert_eq!(reader.string(), Ok("héap".to_string()));
        assert_eq!(reader.position(), out.len());
    }
}
