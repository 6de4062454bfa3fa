//! Locating the last checkpoint and summarizing the log tail.
//!
//! The locator reads every entry of every log file in version order, with
//! the scan state threaded from one file to the next. It never writes.

use crate::error::RecoveryError;
use gstore_log::{
    BatchCursor, CheckPointEntry, LogEntry, LogEntryReader, LogError, LogFiles, LogPosition,
    LogVersion, ReadOutcome, StoreId, TailCorruption, TxId, NO_TRANSACTION_ID,
};

/// Version of the first log file a store ever writes.
pub const INITIAL_LOG_VERSION: LogVersion = 0;

/// A checkpoint together with where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPointInfo {
    pub entry: CheckPointEntry,
    /// Position of the checkpoint entry itself.
    pub position: LogPosition,
}

impl CheckPointInfo {
    /// Position everything before which is durable in the store.
    pub fn target(&self) -> LogPosition {
        self.entry.target
    }
}

/// Summary of the log tail produced by [`CheckPointLocator::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTailInformation {
    pub last_check_point: Option<CheckPointInfo>,
    /// A Start or Commit exists at or after the checkpoint target (or at
    /// all, without a checkpoint).
    pub commits_after_last_check_point: bool,
    /// Id of the first commit at or after the checkpoint target, or
    /// [`NO_TRANSACTION_ID`].
    pub first_tx_id_after_last_check_point: TxId,
    /// Version holding the last checkpoint, or the lowest version present.
    pub oldest_log_version_found: LogVersion,
    /// Set when the scan stopped on data it could not read.
    pub corruption: Option<TailCorruption>,
    /// Set when files the store expects are absent.
    pub missing_logs: Option<String>,
    /// Store identity from the log headers.
    pub store_id: Option<StoreId>,
    /// Position just past the last readable entry.
    pub end_position: Option<LogPosition>,
    /// Id of the last Commit read.
    pub last_committed_tx_id: Option<TxId>,
    /// A Start read after the last Commit, if any.
    pub pending_start: Option<LogPosition>,
}

impl LogTailInformation {
    pub fn is_tail_corrupted(&self) -> bool {
        self.corruption.is_some()
    }

    pub fn has_missing_logs(&self) -> bool {
        self.missing_logs.is_some()
    }

    fn missing(reason: String) -> Self {
        Self {
            last_check_point: None,
            commits_after_last_check_point: false,
            first_tx_id_after_last_check_point: NO_TRANSACTION_ID,
            oldest_log_version_found: INITIAL_LOG_VERSION,
            corruption: None,
            missing_logs: Some(reason),
            store_id: None,
            end_position: None,
            last_committed_tx_id: None,
            pending_start: None,
        }
    }
}

/// State carried across files during the scan.
#[derive(Debug, Default)]
struct ScanState {
    last_check_point: Option<CheckPointInfo>,
    /// Most recent Start or Commit position.
    latest_activity: Option<LogPosition>,
    pending_start: Option<LogPosition>,
    last_committed_tx_id: Option<TxId>,
    store_id: Option<StoreId>,
    end_position: Option<LogPosition>,
    corruption: Option<TailCorruption>,
}

impl ScanState {
    fn accept(mut self, position: LogPosition, end: LogPosition, entry: LogEntry) -> Self {
        match entry {
            LogEntry::Start(_) => {
                self.pending_start = Some(position);
                self.latest_activity = Some(position);
            }
            LogEntry::Commit(commit) => {
                self.pending_start = None;
                self.last_committed_tx_id = Some(commit.tx_id);
                self.latest_activity = Some(position);
            }
            LogEntry::CheckPoint(entry) => {
                self.last_check_point = Some(CheckPointInfo { entry, position });
            }
            LogEntry::Command(_) => {}
        }
        self.end_position = Some(end);
        self
    }
}

/// Scans the log file set and summarizes its tail.
#[derive(Debug, Clone)]
pub struct CheckPointLocator {
    files: LogFiles,
    upper_version: Option<LogVersion>,
    expected_version: Option<LogVersion>,
    logs_required: bool,
}

impl CheckPointLocator {
    pub fn new(files: LogFiles) -> Self {
        Self {
            files,
            upper_version: None,
            expected_version: None,
            logs_required: false,
        }
    }

    /// Ignores files above `version`.
    pub fn with_upper_version(mut self, version: LogVersion) -> Self {
        self.upper_version = Some(version);
        self
    }

    /// Highest version the store expects to exist.
    pub fn with_expected_version(mut self, version: Option<LogVersion>) -> Self {
        self.expected_version = version;
        self
    }

    /// Whether an empty log set means logs went missing.
    pub fn with_logs_required(mut self, required: bool) -> Self {
        self.logs_required = required;
        self
    }

    pub fn files(&self) -> &LogFiles {
        &self.files
    }

    pub fn scan(&self) -> Result<LogTailInformation, RecoveryError> {
        let mut versions = self.files.versions()?;
        if let Some(upper) = self.upper_version {
            versions.retain(|v| *v <= upper);
        }

        let Some(&lowest) = versions.first() else {
            if self.logs_required || self.expected_version.is_some() {
                return Ok(LogTailInformation::missing(format!(
                    "no '{}' log files found but the store has committed transactions",
                    self.files.prefix()
                )));
            }
            return self.summarize(ScanState::default(), INITIAL_LOG_VERSION);
        };

        let expected = match (self.expected_version, self.upper_version) {
            (Some(expected), Some(upper)) => Some(expected.min(upper)),
            (expected, _) => expected,
        };
        let missing: Vec<_> = self
            .files
            .missing_versions(expected)?
            .into_iter()
            .filter(|v| self.upper_version.map_or(true, |upper| *v <= upper))
            .collect();
        if !missing.is_empty() {
            return Ok(LogTailInformation::missing(format!(
                "log versions {:?} are missing",
                missing
            )));
        }

        let highest = versions.last().copied().unwrap_or(lowest);
        let state = versions
            .iter()
            .try_fold(ScanState::default(), |state, &version| {
                if state.corruption.is_some() {
                    Ok(state)
                } else {
                    self.scan_file(state, version, highest)
                }
            })?;

        self.summarize(state, lowest)
    }

    fn scan_file(
        &self,
        mut state: ScanState,
        version: LogVersion,
        highest: LogVersion,
    ) -> Result<ScanState, RecoveryError> {
        let start = LogPosition::start_of(version);
        let mut reader = match LogEntryReader::open(&self.files, start) {
            Ok(reader) => reader,
            Err(LogError::InvalidHeader { path, reason }) if version == highest => {
                tracing::warn!("Unreadable header in {}: {}", path.display(), reason);
                let position = state
                    .end_position
                    .unwrap_or(LogPosition::new(version, 0));
                state.corruption = Some(TailCorruption {
                    position,
                    reason: format!("unreadable header in log version {}", version),
                });
                return Ok(state);
            }
            Err(e) => return Err(RecoveryError::read_log(start)(e)),
        };

        if state.store_id.is_none() {
            state.store_id = Some(reader.header().store_id);
        }
        state.end_position = Some(start);

        loop {
            let position = reader.position();
            match reader
                .next_entry()
                .map_err(RecoveryError::read_log(position))?
            {
                ReadOutcome::Entry(entry) => {
                    state = state.accept(entry.position, entry.end, entry.entry);
                }
                ReadOutcome::EndOfFile(_) => return Ok(state),
                ReadOutcome::Unreadable { position, reason } => {
                    tracing::warn!("Corrupted log entry at {}: {}", position, reason);
                    state.corruption = Some(TailCorruption { position, reason });
                    return Ok(state);
                }
            }
        }
    }

    fn summarize(
        &self,
        state: ScanState,
        lowest: LogVersion,
    ) -> Result<LogTailInformation, RecoveryError> {
        let (commits_after, search_from, oldest) = match &state.last_check_point {
            Some(cp) => (
                state.latest_activity.is_some_and(|p| p >= cp.target()),
                cp.target(),
                cp.position.log_version,
            ),
            None => (
                state.latest_activity.is_some(),
                LogPosition::start_of(lowest),
                lowest,
            ),
        };

        let first_tx_id = if commits_after {
            self.first_commit_from(search_from)?
        } else {
            NO_TRANSACTION_ID
        };

        Ok(LogTailInformation {
            last_check_point: state.last_check_point,
            commits_after_last_check_point: commits_after,
            first_tx_id_after_last_check_point: first_tx_id,
            oldest_log_version_found: oldest,
            corruption: state.corruption,
            missing_logs: None,
            store_id: state.store_id,
            end_position: state.end_position,
            last_committed_tx_id: state.last_committed_tx_id,
            pending_start: state.pending_start,
        })
    }

    /// Id of the first complete batch at or after `from`.
    fn first_commit_from(&self, from: LogPosition) -> Result<TxId, RecoveryError> {
        let mut cursor =
            BatchCursor::open(&self.files, from).map_err(RecoveryError::read_log(from))?;
        let first = cursor
            .next_batch()
            .map_err(RecoveryError::read_log(from))?;
        Ok(first.map_or(NO_TRANSACTION_ID, |batch| batch.tx_id()))
    }
}
