//! Deciding where recovery starts.

use crate::error::RecoveryError;
use crate::locator::{LogTailInformation, INITIAL_LOG_VERSION};
use gstore_log::{LogPosition, TxId, NO_TRANSACTION_ID};
use std::fmt;

/// Where to resume from, as decided from a [`LogTailInformation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStartInformation {
    /// Position to replay from, or [`LogPosition::UNSPECIFIED`].
    pub position: LogPosition,
    pub first_tx_id_after_last_check_point: TxId,
    pub recovery_required: bool,
    pub missing_logs: bool,
}

impl RecoveryStartInformation {
    /// Nothing to replay.
    pub const NO_RECOVERY_REQUIRED: Self = Self {
        position: LogPosition::UNSPECIFIED,
        first_tx_id_after_last_check_point: NO_TRANSACTION_ID,
        recovery_required: false,
        missing_logs: false,
    };

    /// Files the store expects are absent.
    pub const MISSING_LOGS: Self = Self {
        position: LogPosition::UNSPECIFIED,
        first_tx_id_after_last_check_point: NO_TRANSACTION_ID,
        recovery_required: false,
        missing_logs: true,
    };

    pub fn required_from(position: LogPosition, first_tx_id: TxId) -> Self {
        Self {
            position,
            first_tx_id_after_last_check_point: first_tx_id,
            recovery_required: true,
            missing_logs: false,
        }
    }
}

impl fmt::Display for RecoveryStartInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.missing_logs {
            write!(f, "missing logs")
        } else if !self.recovery_required {
            write!(f, "recovery not required")
        } else {
            write!(
                f,
                "recovery required from {} (first tx {})",
                self.position, self.first_tx_id_after_last_check_point
            )
        }
    }
}

/// Turns a tail summary into a start decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStartDecision;

impl RecoveryStartDecision {
    /// Rules, first match wins:
    /// 1. missing logs
    /// 2. no activity after the checkpoint and a clean tail: not required
    /// 3. checkpoint present: start at its target
    /// 4. no checkpoint: start at the first file, or fail if it is gone
    ///
    /// A corrupt tail skips rule 2 so the unreadable bytes get quarantined.
    pub fn decide(info: &LogTailInformation) -> Result<RecoveryStartInformation, RecoveryError> {
        if info.has_missing_logs() {
            return Ok(RecoveryStartInformation::MISSING_LOGS);
        }

        if !info.commits_after_last_check_point && !info.is_tail_corrupted() {
            return Ok(RecoveryStartInformation::NO_RECOVERY_REQUIRED);
        }

        let first_tx_id = info.first_tx_id_after_last_check_point;
        if let Some(cp) = &info.last_check_point {
            return Ok(RecoveryStartInformation::required_from(
                cp.target(),
                first_tx_id,
            ));
        }

        if info.oldest_log_version_found != INITIAL_LOG_VERSION {
            return Err(RecoveryError::NoCheckPointNotAtOrigin {
                oldest_version: info.oldest_log_version_found,
            });
        }

        Ok(RecoveryStartInformation::required_from(
            LogPosition::start_of(INITIAL_LOG_VERSION),
            first_tx_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::CheckPointInfo;
    use gstore_log::{CheckPointEntry, TailCorruption};

    fn info() -> LogTailInformation {
        LogTailInformation {
            last_check_point: None,
            commits_after_last_check_point: false,
            first_tx_id_after_last_check_point: NO_TRANSACTION_ID,
            oldest_log_version_found: 0,
            corruption: None,
            missing_logs: None,
            store_id: None,
            end_position: None,
            last_committed_tx_id: None,
            pending_start: None,
        }
    }

    fn check_point(target: LogPosition) -> Option<CheckPointInfo> {
        Some(CheckPointInfo {
            entry: CheckPointEntry {
                target,
                time_written: 0,
                reason: "test".to_string(),
            },
            position: target,
        })
    }

    #[test]
    fn test_empty_log_not_required() {
        let start = RecoveryStartDecision::decide(&info()).unwrap();
        assert_eq!(start, RecoveryStartInformation::NO_RECOVERY_REQUIRED);
        assert!(!start.position.is_specified());
    }

    #[test]
    fn test_checkpoint_without_activity() {
        let info = LogTailInformation {
            last_check_point: check_point(LogPosition::new(0, 200)),
            ..info()
        };
        let start = RecoveryStartDecision::decide(&info).unwrap();
        assert!(!start.recovery_required);
        assert_eq!(start.position, LogPosition::UNSPECIFIED);
    }

    #[test]
    fn test_checkpoint_with_activity() {
        let target = LogPosition::new(2, 500);
        let info = LogTailInformation {
            last_check_point: check_point(target),
            commits_after_last_check_point: true,
            first_tx_id_after_last_check_point: 17,
            oldest_log_version_found: 2,
            ..info()
        };
        let start = RecoveryStartDecision::decide(&info).unwrap();
        assert!(start.recovery_required);
        assert_eq!(start.position, target);
        assert_eq!(start.first_tx_id_after_last_check_point, 17);
    }

    #[test]
    fn test_no_checkpoint_at_origin() {
        let info = LogTailInformation {
            commits_after_last_check_point: true,
            first_tx_id_after_last_check_point: 2,
            ..info()
        };
        let start = RecoveryStartDecision::decide(&info).unwrap();
        assert!(start.recovery_required);
        assert_eq!(start.position, LogPosition::start_of(0));
    }

    #[test]
    fn test_no_checkpoint_not_at_origin_fails() {
        let info = LogTailInformation {
            commits_after_last_check_point: true,
            oldest_log_version_found: 3,
            ..info()
        };
        assert!(matches!(
            RecoveryStartDecision::decide(&info),
            Err(RecoveryError::NoCheckPointNotAtOrigin { oldest_version: 3 })
        ));
    }

    #[test]
    fn test_missing_logs_wins() {
        let info = LogTailInformation {
            commits_after_last_check_point: true,
            oldest_log_version_found: 3,
            missing_logs: Some("gap".to_string()),
            ..info()
        };
        let start = RecoveryStartDecision::decide(&info).unwrap();
        assert_eq!(start, RecoveryStartInformation::MISSING_LOGS);
    }

    #[test]
    fn test_corrupt_tail_forces_recovery() {
        let target = LogPosition::new(0, 96);
        let info = LogTailInformation {
            last_check_point: check_point(target),
            corruption: Some(TailCorruption {
                position: LogPosition::new(0, 140),
                reason: "bad magic".to_string(),
            }),
            ..info()
        };
        let start = RecoveryStartDecision::decide(&info).unwrap();
        assert!(start.recovery_required);
        assert_eq!(start.position, target);
        assert_eq!(start.first_tx_id_after_last_check_point, NO_TRANSACTION_ID);
    }
}
