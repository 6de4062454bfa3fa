//! Recovery error types.

use gstore_log::{LogError, LogPosition, LogVersion, StoreId, TxId};
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error returned by collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from recovery.
///
/// A corrupt tail is not an error on its own; it is resolved by truncation
/// unless strict mode is configured, in which case it surfaces as
/// [`RecoveryError::CorruptedLogs`].
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("missing transaction logs in {}: {reason}", dir.display())]
    MissingLogs { dir: PathBuf, reason: String },

    #[error(
        "no checkpoint found and the oldest log file is version {oldest_version}, \
         not the first version; cannot determine where recovery should start"
    )]
    NoCheckPointNotAtOrigin { oldest_version: LogVersion },

    #[error("transaction logs belong to store {log}, but the store is {store}")]
    StoreIdMismatch { log: StoreId, store: StoreId },

    #[error("transaction log is corrupted at {position}: {reason}")]
    CorruptedLogs { position: LogPosition, reason: String },

    #[error("inconsistent transaction chain for tx {tx_id} at {position}: {reason}")]
    InconsistentChain {
        tx_id: TxId,
        position: LogPosition,
        reason: String,
    },

    #[error("failed to read transaction log at {position}: {source}")]
    ReadLog {
        position: LogPosition,
        #[source]
        source: LogError,
    },

    #[error("failed to truncate transaction log at {position}: {source}")]
    Truncate {
        position: LogPosition,
        #[source]
        source: LogError,
    },

    #[error("failed to write corrupted-log archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("failed to apply transaction {tx_id} at {position}: {source}")]
    Apply {
        tx_id: TxId,
        position: LogPosition,
        #[source]
        source: BoxError,
    },

    #[error("transaction id store error: {0}")]
    IdStore(#[source] BoxError),

    #[error("failed to initialize {component}: {source}")]
    Init {
        component: String,
        #[source]
        source: BoxError,
    },

    #[error("recovery aborted")]
    Aborted,

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecoveryError {
    /// Returns whether recovery stopped because shutdown was requested.
    pub fn is_aborted(&self) -> bool {
        matches!(self, RecoveryError::Aborted)
    }

    pub(crate) fn read_log(position: LogPosition) -> impl FnOnce(LogError) -> Self {
        move |source| RecoveryError::ReadLog { position, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborted_is_distinct() {
        assert!(RecoveryError::Aborted.is_aborted());
        let missing = RecoveryError::MissingLogs {
            dir: PathBuf::from("/data"),
            reason: "gap".to_string(),
        };
        assert!(!missing.is_aborted());
    }

    #[test]
    fn test_context_in_message() {
        let err = RecoveryError::Apply {
            tx_id: 9,
            position: LogPosition::new(2, 64),
            source: "boom".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("transaction 9"));
        assert!(msg.contains("version=2"));
    }
}
