//! End-to-end recovery.
//!
//! ```text
//! NOT_STARTED ──(not required)──────────────────────────────────► INITIALIZED
//!      │
//!      └─► REVERSE_SCAN ─► FORWARD_REPLAY ─► TRUNCATE ─► BOOKKEEPING_UPDATE ─► INITIALIZED
//!               │                │
//!               └────────────────┴─► ABORTED
//! ```
//!
//! The reverse pass only reads; it finds where the log can be trusted to
//! end. The forward pass replays everything before that point, after which
//! the remainder is quarantined and the id store is brought up to date.

use crate::collaborators::{
    AbortOracle, ApplyMode, ClosedTransaction, Lifecycle, NeverAbort, NoopRecoveryMonitor,
    ProgressReporter, RecoveryMonitor, SilentProgress, TransactionApplier, TransactionIdStore,
};
use crate::config::RecoveryConfig;
use crate::decision::{RecoveryStartDecision, RecoveryStartInformation};
use crate::error::RecoveryError;
use crate::locator::{CheckPointLocator, LogTailInformation};
use crate::tail::{compute_valid_tail, ValidTail};
use crate::tracker::TransactionIdTracker;
use crate::truncator::CorruptedLogsTruncator;
use gstore_log::{
    BatchCursor, CommandBatch, LogError, LogFiles, LogPosition, LogWriter, ReversedBatchCursor,
    BASE_TX_ID,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reason recorded in the checkpoint written after a successful recovery.
pub const RECOVERY_CHECK_POINT_REASON: &str = "recovery completed";

/// Recovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    NotStarted,
    ReverseScan,
    ForwardReplay,
    Truncate,
    BookkeepingUpdate,
    Initialized,
    Aborted,
}

/// What recovery would do, computed without touching storage or logs.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub tail: LogTailInformation,
    pub start: RecoveryStartInformation,
    /// Present when recovery is required.
    pub valid_tail: Option<ValidTail>,
}

impl RecoveryPlan {
    /// Bytes after the valid tail that recovery would quarantine.
    pub fn bytes_to_quarantine(&self, files: &LogFiles) -> Result<u64, RecoveryError> {
        let Some(valid) = &self.valid_tail else {
            return Ok(0);
        };
        let mut total = 0;
        for version in files.versions()? {
            let size = files.file_size(version)?;
            if version == valid.position.log_version {
                total += size.saturating_sub(valid.position.byte_offset);
            } else if version > valid.position.log_version {
                total += size;
            }
        }
        Ok(total)
    }
}

/// Result of [`RecoveryOrchestrator::recover`].
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub start: RecoveryStartInformation,
    pub recovery_performed: bool,
    /// Where the log ends after recovery.
    pub valid_tail: Option<LogPosition>,
    pub applied_batches: usize,
    pub recovered_transactions: usize,
    pub last_closed: Option<ClosedTransaction>,
    /// Archive holding whatever was cut off the log.
    pub archive: Option<PathBuf>,
    /// Position just past the checkpoint written after replay.
    pub check_point: Option<LogPosition>,
    pub tracker: Arc<TransactionIdTracker>,
    pub elapsed: Duration,
}

/// Scans the log and decides where recovery starts.
///
/// Everything that must fail before the log is touched fails here: missing
/// logs, a foreign store id, a corrupt tail in strict mode, and an unknown
/// starting point.
pub fn locate_start(
    config: &RecoveryConfig,
    id_store: &dyn TransactionIdStore,
) -> Result<(LogTailInformation, RecoveryStartInformation), RecoveryError> {
    let files = config.log_files();
    let info = CheckPointLocator::new(files.clone())
        .with_expected_version(id_store.expected_log_version())
        .with_logs_required(id_store.last_committed_tx_id() > BASE_TX_ID)
        .scan()?;

    if let Some(reason) = &info.missing_logs {
        return Err(RecoveryError::MissingLogs {
            dir: files.dir().to_path_buf(),
            reason: reason.clone(),
        });
    }

    if !config.ignore_store_id_validation {
        if let (Some(log), Some(store)) = (info.store_id, id_store.store_id()) {
            if log != store {
                return Err(RecoveryError::StoreIdMismatch { log, store });
            }
        }
    }

    if let Some(corruption) = &info.corruption {
        if config.fail_on_corrupted_log_files {
            return Err(RecoveryError::CorruptedLogs {
                position: corruption.position,
                reason: corruption.reason.clone(),
            });
        }
        tracing::warn!(
            "Transaction log is corrupted at {}: {}",
            corruption.position,
            corruption.reason
        );
    }

    let start = RecoveryStartDecision::decide(&info)?;
    Ok((info, start))
}

/// Computes what recovery would do. Never writes.
pub fn plan_recovery(
    config: &RecoveryConfig,
    id_store: &dyn TransactionIdStore,
) -> Result<RecoveryPlan, RecoveryError> {
    let (tail, start) = locate_start(config, id_store)?;
    let valid_tail = if start.recovery_required {
        let files = config.log_files();
        let cursor = ReversedBatchCursor::open(&files, start.position)
            .map_err(RecoveryError::read_log(start.position))?;
        Some(compute_valid_tail(start.position, cursor, |_| Ok(()))?)
    } else {
        None
    };
    Ok(RecoveryPlan {
        tail,
        start,
        valid_tail,
    })
}

/// Drives recovery at engine startup.
pub struct RecoveryOrchestrator<'a> {
    config: RecoveryConfig,
    applier: &'a mut dyn TransactionApplier,
    id_store: &'a mut dyn TransactionIdStore,
    progress: Box<dyn ProgressReporter + 'a>,
    abort: Box<dyn AbortOracle + 'a>,
    monitor: Arc<dyn RecoveryMonitor + Send + Sync>,
    components: Vec<&'a mut dyn Lifecycle>,
    tracker: Arc<TransactionIdTracker>,
    state: RecoveryState,
}

impl<'a> RecoveryOrchestrator<'a> {
    pub fn new(
        config: RecoveryConfig,
        applier: &'a mut dyn TransactionApplier,
        id_store: &'a mut dyn TransactionIdStore,
    ) -> Self {
        Self {
            config,
            applier,
            id_store,
            progress: Box::new(SilentProgress),
            abort: Box::new(NeverAbort),
            monitor: Arc::new(NoopRecoveryMonitor),
            components: Vec::new(),
            tracker: Arc::new(TransactionIdTracker::new()),
            state: RecoveryState::NotStarted,
        }
    }

    pub fn with_progress(mut self, progress: impl ProgressReporter + 'a) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn with_abort(mut self, abort: impl AbortOracle + 'a) -> Self {
        self.abort = Box::new(abort);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn RecoveryMonitor + Send + Sync>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Shares a tracker with whatever applies transactions after recovery.
    pub fn with_tracker(mut self, tracker: Arc<TransactionIdTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Adds a component to initialize once the log is consistent.
    pub fn with_component(mut self, component: &'a mut dyn Lifecycle) -> Self {
        self.components.push(component);
        self
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn tracker(&self) -> &Arc<TransactionIdTracker> {
        &self.tracker
    }

    /// Runs recovery to completion, abort or failure.
    pub fn recover(&mut self) -> Result<RecoveryOutcome, RecoveryError> {
        let started = Instant::now();
        self.state = RecoveryState::NotStarted;

        let (info, start) = locate_start(&self.config, &*self.id_store)?;
        if !start.recovery_required {
            tracing::debug!("No recovery required");
            self.init_components()?;
            self.state = RecoveryState::Initialized;
            return Ok(RecoveryOutcome {
                start,
                recovery_performed: false,
                valid_tail: None,
                applied_batches: 0,
                recovered_transactions: 0,
                last_closed: None,
                archive: None,
                check_point: None,
                tracker: Arc::clone(&self.tracker),
                elapsed: started.elapsed(),
            });
        }

        match self.replay(&info, start, started) {
            Err(e) if e.is_aborted() => {
                self.state = RecoveryState::Aborted;
                self.monitor.recovery_aborted();
                Err(e)
            }
            other => other,
        }
    }

    fn replay(
        &mut self,
        info: &LogTailInformation,
        start: RecoveryStartInformation,
        started: Instant,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let files = self.config.log_files();
        tracing::info!(
            "Recovery required from {} (first tx {})",
            start.position,
            start.first_tx_id_after_last_check_point
        );
        self.monitor.recovery_required(start.position);

        self.state = RecoveryState::ReverseScan;
        let tail = self.reverse_scan(&files, start.position)?;
        self.monitor
            .reverse_scan_completed(tail.position, tail.batches);
        for tx_id in &tail.incomplete {
            tracing::warn!(
                "Transaction {} was not completed before the crash and will not be recovered",
                tx_id
            );
        }

        self.state = RecoveryState::ForwardReplay;
        let replayed = self.forward_replay(&files, start.position, &tail)?;
        if self.abort.should_abort() {
            return Err(RecoveryError::Aborted);
        }

        self.state = RecoveryState::Truncate;
        let archive = CorruptedLogsTruncator::new(
            files.clone(),
            self.config.quarantine_dir(),
            &*self.monitor,
        )
        .truncate(tail.position)?;

        self.state = RecoveryState::BookkeepingUpdate;
        if let Some(closed) = replayed.last_closed {
            self.id_store
                .set_last_closed_transaction(closed)
                .map_err(RecoveryError::IdStore)?;
        }
        let check_point = self.write_check_point(&files, info, tail.position)?;

        self.init_components()?;
        self.state = RecoveryState::Initialized;

        let elapsed = started.elapsed();
        self.monitor
            .recovery_completed(replayed.transactions, elapsed);

        Ok(RecoveryOutcome {
            start,
            recovery_performed: true,
            valid_tail: Some(tail.position),
            applied_batches: replayed.batches,
            recovered_transactions: replayed.transactions,
            last_closed: replayed.last_closed,
            archive,
            check_point,
            tracker: Arc::clone(&self.tracker),
            elapsed,
        })
    }

    fn reverse_scan(
        &mut self,
        files: &LogFiles,
        start: LogPosition,
    ) -> Result<ValidTail, RecoveryError> {
        let cursor =
            ReversedBatchCursor::open(files, start).map_err(RecoveryError::read_log(start))?;
        let applier = &mut *self.applier;
        let abort = &*self.abort;

        compute_valid_tail(start, cursor, |batch| {
            if abort.should_abort() {
                return Err(RecoveryError::Aborted);
            }
            applier
                .apply(batch, ApplyMode::Reverse)
                .map_err(|source| apply_error(batch, source))
        })
    }

    fn forward_replay(
        &mut self,
        files: &LogFiles,
        start: LogPosition,
        tail: &ValidTail,
    ) -> Result<Replayed, RecoveryError> {
        let mut cursor =
            BatchCursor::open(files, start).map_err(RecoveryError::read_log(start))?;
        let mut replayed = Replayed::default();
        self.progress.start(tail.transactions as u64);

        while replayed.batches < tail.batches {
            let position = cursor.valid_position();
            let batch = cursor
                .next_batch()
                .map_err(RecoveryError::read_log(position))?
                .ok_or_else(|| RecoveryError::ReadLog {
                    position,
                    source: LogError::InvalidBatch(format!(
                        "log ended before the valid tail at {}",
                        tail.position
                    )),
                })?;

            if !tail.replays(batch.tx_id()) {
                tracing::debug!(
                    "Skipping batch of incomplete tx {} at {}",
                    batch.tx_id(),
                    batch.start_position
                );
                continue;
            }
            if self.abort.should_abort() {
                return Err(RecoveryError::Aborted);
            }

            self.applier
                .apply(&batch, ApplyMode::Recovery)
                .map_err(|source| apply_error(&batch, source))?;
            self.tracker.track_batch(&batch);

            replayed.batches += 1;
            if batch.is_last() {
                replayed.transactions += 1;
                replayed.last_closed = Some(ClosedTransaction {
                    tx_id: batch.tx_id(),
                    checksum: batch.checksum(),
                    commit_timestamp: batch.commit_timestamp(),
                    position: batch.end_position,
                });
                self.progress.progress(1);
            }
            self.monitor.batch_recovered(&batch);
        }

        self.progress.completed();
        Ok(replayed)
    }

    /// Marks the recovered log as durable so a restart finds nothing to do.
    fn write_check_point(
        &mut self,
        files: &LogFiles,
        info: &LogTailInformation,
        target: LogPosition,
    ) -> Result<Option<LogPosition>, RecoveryError> {
        let Some(store_id) = info.store_id else {
            return Ok(None);
        };

        self.applier.flush().map_err(|source| RecoveryError::Init {
            component: "storage".to_string(),
            source,
        })?;

        let mut writer = LogWriter::open(files.clone(), store_id)?;
        let end = writer.check_point(target, RECOVERY_CHECK_POINT_REASON)?;
        writer.close()?;
        Ok(Some(end))
    }

    fn init_components(&mut self) -> Result<(), RecoveryError> {
        for component in self.components.iter_mut() {
            component.init().map_err(|source| RecoveryError::Init {
                component: component.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Replayed {
    batches: usize,
    transactions: usize,
    last_closed: Option<ClosedTransaction>,
}

fn apply_error(batch: &CommandBatch, source: crate::error::BoxError) -> RecoveryError {
    RecoveryError::Apply {
        tx_id: batch.tx_id(),
        position: batch.start_position,
        source,
    }
}
