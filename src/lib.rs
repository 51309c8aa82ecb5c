//! Analysis core for GPU memory traces.
//!
//! A trace is decoded into time-ordered memory events, replayed into a live
//! model of allocations, resources and page mappings, and indexed so that the
//! state at any timestamp can be reconstructed quickly. On top of that sit
//! snapshots with derived totals and aliasing, per-resource history and
//! snapshot persistence.

pub mod cancel;
pub mod config;
pub mod dataset;
pub mod error;
pub mod format;
pub mod history;
pub mod jobs;
pub mod mmap;
pub mod parser;
pub mod snapshot;
pub mod state;
pub mod strings;
pub mod types;
pub mod writer;

pub use cancel::{CancelToken, NoProgress, Phase, Progress, ProgressSink};
pub use config::{BuildConfig, DuplicateResourcePolicy};
pub use dataset::{DataSet, SnapshotPoint};
pub use error::{Error, Result};
pub use format::TraceFile;
pub use history::{HistoryEvent, HistoryKind, ResourceHistory};
pub use snapshot::{compare, Snapshot, SnapshotDelta};
pub use state::LiveState;
