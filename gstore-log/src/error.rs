//! Log error types.

use crate::position::LogPosition;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during log operations.
///
/// Unreadable entries are not errors: readers report them as
/// [`ReadOutcome::Unreadable`](crate::reader::ReadOutcome) so callers can
/// quarantine the tail.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log header in {}: {reason}", path.display())]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("log file for version {0} not found")]
    FileNotFound(u64),

    #[error("position {0} is before the start of the log file")]
    PositionInHeader(LogPosition),

    #[error("entry too large: {size} bytes (max {max})")]
    EntryTooLarge { size: usize, max: usize },

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("log writer is closed")]
    Closed,
}

impl LogError {
    pub(crate) fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LogError::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Returns whether this error is an I/O failure.
    pub fn is_io(&self) -> bool {
        matches!(self, LogError::Io(_) | LogError::FileIo { .. })
    }
}
