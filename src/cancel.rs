use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Cooperative cancellation flag shared between a caller and long-running work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Stage of a build reported with each [`Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Streams located and the merge heap primed.
    Parse,
    /// Events being applied.
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_consumed: u64,
    pub bytes_total: u64,
    pub phase: Phase,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return 1.0;
        }
        self.bytes_consumed as f64 / self.bytes_total as f64
    }
}

/// Receives progress reports. Returning `false` requests cancellation.
pub trait ProgressSink {
    fn report(&mut self, progress: Progress) -> bool;
}

impl<F> ProgressSink for F
where
    F: FnMut(Progress) -> bool,
{
    fn report(&mut self, progress: Progress) -> bool {
        self(progress)
    }
}

/// Sink that ignores every report.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _progress: Progress) -> bool {
        true
    }
}
