//! Log positions.

use crate::LOG_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the logical multi-file log stream.
///
/// Ordering is by version first, byte offset second, so any position in a
/// later file sorts after every position in an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub log_version: u64,
    pub byte_offset: u64,
}

impl LogPosition {
    /// Marker for "no position", e.g. when no recovery is needed.
    pub const UNSPECIFIED: LogPosition = LogPosition {
        log_version: u64::MAX,
        byte_offset: u64::MAX,
    };

    pub const fn new(log_version: u64, byte_offset: u64) -> Self {
        Self {
            log_version,
            byte_offset,
        }
    }

    /// Position of the first entry in the given file, just after its header.
    pub const fn start_of(log_version: u64) -> Self {
        Self::new(log_version, LOG_HEADER_SIZE)
    }

    pub fn is_specified(&self) -> bool {
        *self != Self::UNSPECIFIED
    }

    /// Returns the position `len` bytes further into the same file.
    pub fn advance(&self, len: u64) -> Self {
        Self::new(self.log_version, self.byte_offset + len)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_specified() {
            write!(f, "LogPosition{{version={}, offset={}}}", self.log_version, self.byte_offset)
        } else {
            write!(f, "LogPosition{{UNSPECIFIED}}")
        }
    }
}
