//! Snapshot writers and their readers.
//!
//! Both layouts are written to a temporary sibling file, synced, renamed over
//! the destination and followed by a sync of the parent directory. A failed
//! write removes the temporary file and leaves any existing destination alone.

pub mod container;
pub mod legacy;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::Result;

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

fn write_tmp(tmp: &Path, parts: &[&[u8]]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)?;
    for part in parts {
        file.write_all(part)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Writes the concatenation of `parts` to `path` atomically.
pub(crate) fn write_atomic(path: &Path, parts: &[&[u8]]) -> Result<()> {
    let tmp = tmp_path(path);
    let result = write_tmp(&tmp, parts)
        .and_then(|()| std::fs::rename(&tmp, path).map_err(Into::into))
        .and_then(|()| sync_dir(parent_dir(path)));
    match result {
        Ok(()) => {
            debug!("wrote {}", path.display());
            Ok(())
        }
        Err(err) => {
            if tmp.exists() {
                if let Err(remove) = std::fs::remove_file(&tmp) {
                    warn!("could not remove {}: {remove}", tmp.display());
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_leaves_no_tmp() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.rmts");
        write_atomic(&path, &[b"abc", b"def"])?;
        assert_eq!(std::fs::read(&path)?, b"abcdef");
        assert!(!tmp_path(&path).exists());
        Ok(())
    }

    #[test]
    fn write_into_missing_directory_fails_cleanly() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("missing").join("out.rmts");
        assert!(write_atomic(&path, &[b"abc"]).is_err());
        assert!(!tmp_path(&path).exists());
        Ok(())
    }
}
