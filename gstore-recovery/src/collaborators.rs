//! Interfaces recovery consumes from the rest of the engine.

use crate::error::BoxError;
use gstore_log::{CommandBatch, LogPosition, LogVersion, StoreId, TxId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a batch is handed to the applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Validation only, most recent first. Must not change storage.
    Reverse,
    /// Replay against storage in commit order.
    Recovery,
}

/// Applies replayed batches to storage.
pub trait TransactionApplier {
    fn apply(&mut self, batch: &CommandBatch, mode: ApplyMode) -> Result<(), BoxError>;

    /// Makes everything applied so far durable. Called before recovery
    /// writes its closing checkpoint.
    fn flush(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The last transaction known to be closed, as persisted by the id store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedTransaction {
    pub tx_id: TxId,
    pub checksum: u32,
    pub commit_timestamp: i64,
    /// Position just past the transaction's last batch.
    pub position: LogPosition,
}

/// Durable transaction-id bookkeeping.
pub trait TransactionIdStore {
    /// Id of the last committed transaction the store knows about.
    fn last_committed_tx_id(&self) -> TxId;

    fn last_closed_transaction(&self) -> Option<ClosedTransaction>;

    /// Highest log version the store expects to exist, if it knows one.
    fn expected_log_version(&self) -> Option<LogVersion> {
        self.last_closed_transaction()
            .map(|tx| tx.position.log_version)
    }

    /// Identity of the store the logs must belong to.
    fn store_id(&self) -> Option<StoreId>;

    fn set_last_closed_transaction(&mut self, tx: ClosedTransaction) -> Result<(), BoxError>;
}

/// Receives replay progress, counted in transactions.
pub trait ProgressReporter {
    fn start(&mut self, total: u64);
    fn progress(&mut self, delta: u64);
    fn completed(&mut self);
}

impl<T: ProgressReporter + ?Sized> ProgressReporter for &mut T {
    fn start(&mut self, total: u64) {
        (**self).start(total)
    }

    fn progress(&mut self, delta: u64) {
        (**self).progress(delta)
    }

    fn completed(&mut self) {
        (**self).completed()
    }
}

/// Progress reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn start(&mut self, _total: u64) {}
    fn progress(&mut self, _delta: u64) {}
    fn completed(&mut self) {}
}

/// Answers whether recovery should stop early.
///
/// Polled between batches from the recovery thread; may be flipped
/// from any other thread.
pub trait AbortOracle {
    fn should_abort(&self) -> bool;
}

impl AbortOracle for AtomicBool {
    fn should_abort(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<T: AbortOracle + ?Sized> AbortOracle for &T {
    fn should_abort(&self) -> bool {
        (**self).should_abort()
    }
}

impl<T: AbortOracle + ?Sized> AbortOracle for Arc<T> {
    fn should_abort(&self) -> bool {
        (**self).should_abort()
    }
}

/// Oracle that never aborts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAbort;

impl AbortOracle for NeverAbort {
    fn should_abort(&self) -> bool {
        false
    }
}

/// A component initialized once recovery is done (or found unnecessary).
pub trait Lifecycle {
    fn name(&self) -> &str;
    fn init(&mut self) -> Result<(), BoxError>;
}

/// Observer of recovery events. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait RecoveryMonitor {
    fn recovery_required(&self, from: LogPosition) {}
    fn reverse_scan_completed(&self, valid_tail: LogPosition, batches: usize) {}
    fn batch_recovered(&self, batch: &CommandBatch) {}
    fn archive_registered(&self, archive: &Path) {}
    fn archive_started(&self, archive: &Path) {}
    fn archive_finished(&self, archive: &Path) {}
    fn archive_failed(&self, archive: &Path, error: &str) {}
    fn recovery_completed(&self, recovered_transactions: usize, elapsed: Duration) {}
    fn recovery_aborted(&self) {}
}

/// Monitor that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecoveryMonitor;

impl RecoveryMonitor for NoopRecoveryMonitor {}

/// Monitor that turns events into tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRecoveryMonitor;

impl RecoveryMonitor for LoggingRecoveryMonitor {
    fn recovery_required(&self, from: LogPosition) {
        tracing::info!("Recovery required from position {}", from);
    }

    fn reverse_scan_completed(&self, valid_tail: LogPosition, batches: usize) {
        tracing::info!(
            "Reverse scan done: {} batches, valid tail at {}",
            batches,
            valid_tail
        );
    }

    fn batch_recovered(&self, batch: &CommandBatch) {
        tracing::debug!(
            "Recovered batch of tx {} at {}",
            batch.tx_id(),
            batch.start_position
        );
    }

    fn archive_registered(&self, archive: &Path) {
        tracing::info!("Corrupted log archive registered: {}", archive.display());
    }

    fn archive_started(&self, archive: &Path) {
        tracing::debug!("Writing corrupted log archive {}", archive.display());
    }

    fn archive_finished(&self, archive: &Path) {
        tracing::info!("Corrupted log archive written: {}", archive.display());
    }

    fn archive_failed(&self, archive: &Path, error: &str) {
        tracing::error!(
            "Failed to write corrupted log archive {}: {}",
            archive.display(),
            error
        );
    }

    fn recovery_completed(&self, recovered_transactions: usize, elapsed: Duration) {
        tracing::info!(
            "Recovery completed: {} transactions in {:?}",
            recovered_transactions,
            elapsed
        );
    }

    fn recovery_aborted(&self) {
        tracing::warn!("Recovery aborted");
    }
}
