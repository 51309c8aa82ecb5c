use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::{Error, Result};

/// Read-only mapping of a trace file.
pub struct MmapFile {
    _file: File,
    map: Mmap,
    len: usize,
}

impl MmapFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::malformed("trace file larger than address space"))?;
        if len == 0 {
            return Err(Error::malformed("trace file is empty"));
        }
        let map = unsafe { MmapOptions::new().len(len).map(&file)? };
        Ok(Self {
            _file: file,
            map,
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::malformed("range overflow"))?;
        if end > self.len {
            return Err(Error::malformed("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Backing bytes of an opened trace: a file mapping or an owned buffer.
pub enum TraceBytes {
    Mapped(MmapFile),
    Owned(Vec<u8>),
}

impl TraceBytes {
    pub fn map(path: &Path) -> Result<Self> {
        Ok(TraceBytes::Mapped(MmapFile::open(path)?))
    }
}

impl Deref for TraceBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            TraceBytes::Mapped(map) => map.as_slice(),
            TraceBytes::Owned(bytes) => bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn maps_file_contents() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("trace.bin");
        std::fs::write(&path, b"RMTF0123")?;
        let map = MmapFile::open(&path)?;
        assert_eq!(map.len(), 8);
        assert_eq!(map.range(4, 4)?, b"0123");
        assert!(map.range(6, 4).is_err());
        Ok(())
    }

    #[test]
    fn empty_file_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"")?;
        assert!(matches!(
            MmapFile::open(&path),
            Err(Error::MalformedTrace(_))
        ));
        Ok(())
    }
}
