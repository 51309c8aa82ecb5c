use thiserror::Error;

/// Errors reported by the trace core.
///
/// Token-level failures carry the stream index and byte offset so a caller can
/// point at the offending bytes; structural failures carry a short description.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed trace: {0}")]
    MalformedTrace(String),
    #[error("unsupported version {version} for {what}")]
    UnsupportedVersion { what: String, version: u32 },
    #[error("malformed token in stream {stream} at offset {offset}: {reason}")]
    MalformedToken {
        stream: usize,
        offset: usize,
        reason: &'static str,
    },
    #[error("truncated token in stream {stream} at offset {offset}")]
    TruncatedToken { stream: usize, offset: usize },
    #[error("timestamp regress in stream {stream}: {timestamp} precedes {previous}")]
    TimestampRegress {
        stream: usize,
        previous: u64,
        timestamp: u64,
    },
    #[error("duplicate allocation at {address:#x}")]
    DuplicateAllocation { address: u64 },
    #[error("duplicate resource identifier {0}")]
    DuplicateResource(u64),
    #[error("unknown resource {0}")]
    UnknownResource(u64),
    #[error("out of memory")]
    OutOfMemory,
    #[error("data set has not been built")]
    NotBuilt,
    #[error("cancelled")]
    Cancelled,
    #[error("worker panicked")]
    WorkerPanicked,
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedTrace(msg.into())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;
