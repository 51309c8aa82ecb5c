//! Build configuration.
//!
//! Defines the knobs for index density, worker parallelism and the handling of
//! ambiguous trace content.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for building a data set and deriving snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Events between timestamp index entries.
    /// Default: 4096
    pub index_stride: u32,

    /// Index entries between stored state checkpoints.
    /// Default: 16
    pub checkpoint_interval: u32,

    /// Worker threads for derivation passes. Zero selects the hardware parallelism.
    /// Default: 0
    pub worker_threads: usize,

    /// What to do when a resource is created with an identifier that is still live.
    /// Default: keep the first record
    pub duplicate_resources: DuplicateResourcePolicy,

    /// Events between progress callbacks.
    /// Default: 65536
    pub progress_interval: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            index_stride: 4096,
            checkpoint_interval: 16,
            worker_threads: 0,
            duplicate_resources: DuplicateResourcePolicy::KeepFirst,
            progress_interval: 65_536,
        }
    }
}

impl BuildConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: BuildConfig = serde_json::from_slice(&bytes)
            .map_err(|err| Error::malformed(format!("config {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index_stride == 0 {
            return Err(Error::malformed("index_stride must be non-zero"));
        }
        if self.checkpoint_interval == 0 {
            return Err(Error::malformed("checkpoint_interval must be non-zero"));
        }
        Ok(())
    }

    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Handling of a resource-create whose identifier names a live resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateResourcePolicy {
    /// Lenient: the first record wins and the repeated create is ignored.
    KeepFirst,
    /// Strict: the build fails with `DuplicateResource`.
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_json_fills_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("build.json");
        std::fs::write(&path, br#"{"index_stride": 64, "duplicate_resources": "reject"}"#)?;
        let config = BuildConfig::load(&path)?;
        assert_eq!(config.index_stride, 64);
        assert_eq!(config.checkpoint_interval, 16);
        assert_eq!(config.duplicate_resources, DuplicateResourcePolicy::Reject);
        Ok(())
    }

    #[test]
    fn zero_stride_rejected() {
        let config = BuildConfig {
            index_stride: 0,
            ..BuildConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
