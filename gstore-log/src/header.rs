//! Log file header.
//!
//! Every log file starts with a fixed 32-byte header:
//!
//! ```text
//! +----------+----------+----------+---------------------+
//! | magic    | format   | reserved | store creation time |
//! | 4 bytes  | 1 byte   | 3 bytes  | 8 bytes             |
//! +----------+----------+----------+---------------------+
//! | store random        | last committed tx of prev file |
//! | 8 bytes             | 8 bytes                        |
//! +---------------------+--------------------------------+
//! ```

use crate::error::LogError;
use crate::{TxId, LOG_HEADER_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Magic bytes for log files: "GSTL"
pub const LOG_MAGIC: [u8; 4] = *b"GSTL";

/// Current log format version.
pub const CURRENT_FORMAT_VERSION: u8 = 1;

/// Identity of the store a log belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    pub creation_time: i64,
    pub random: u64,
}

impl StoreId {
    pub const fn new(creation_time: i64, random: u64) -> Self {
        Self {
            creation_time,
            random,
        }
    }

    /// Generates a fresh store identity.
    pub fn generate() -> Self {
        let (random, _) = uuid::Uuid::new_v4().as_u64_pair();
        Self {
            creation_time: chrono::Utc::now().timestamp_millis(),
            random,
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId{{{:x}-{:016x}}}", self.creation_time, self.random)
    }
}

/// Parsed log file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub format_version: u8,
    pub store_id: StoreId,
    /// Last transaction committed in the previous log file.
    pub last_committed_tx_id: TxId,
}

impl LogHeader {
    pub fn new(store_id: StoreId, last_committed_tx_id: TxId) -> Self {
        Self {
            format_version: CURRENT_FORMAT_VERSION,
            store_id,
            last_committed_tx_id,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(LOG_HEADER_SIZE as usize);
        buf.put_slice(&LOG_MAGIC);
        buf.put_u8(self.format_version);
        buf.put_slice(&[0u8; 3]);
        buf.put_i64(self.store_id.creation_time);
        buf.put_u64(self.store_id.random);
        buf.put_u64(self.last_committed_tx_id);
        buf
    }

    /// Decodes a header read from `path`.
    pub fn decode(mut bytes: &[u8], path: &Path) -> Result<Self, LogError> {
        if bytes.len() < LOG_HEADER_SIZE as usize {
            return Err(LogError::InvalidHeader {
                path: path.to_path_buf(),
                reason: format!(
                    "header truncated: {} of {} bytes",
                    bytes.len(),
                    LOG_HEADER_SIZE
                ),
            });
        }

        let mut magic = [0u8; 4];
        bytes.copy_to_slice(&mut magic);
        if magic != LOG_MAGIC {
            return Err(LogError::InvalidHeader {
                path: path.to_path_buf(),
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let format_version = bytes.get_u8();
        if format_version == 0 || format_version > CURRENT_FORMAT_VERSION {
            return Err(LogError::InvalidHeader {
                path: path.to_path_buf(),
                reason: format!("unsupported format version {}", format_version),
            });
        }
        bytes.advance(3);

        let creation_time = bytes.get_i64();
        let random = bytes.get_u64();
        let last_committed_tx_id = bytes.get_u64();

        Ok(Self {
            format_version,
            store_id: StoreId::new(creation_time, random),
            last_committed_tx_id,
        })
    }
}
