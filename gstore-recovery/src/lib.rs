//! # gstore-recovery
//!
//! Crash recovery for the gstore transaction log.
//!
//! Run once at startup, before the store accepts writes:
//! - [`CheckPointLocator`] scans the log and summarizes its tail
//! - [`RecoveryStartDecision`] picks where replay starts, if anywhere
//! - [`RecoveryOrchestrator`] validates the tail newest-first, replays
//!   forward, quarantines what cannot be trusted and updates the
//!   [`TransactionIdStore`]
//! - [`TransactionIdTracker`] records which transactions have all their
//!   batches applied
//!
//! # Example
//!
//! ```no_run
//! use gstore_recovery::{
//!     ApplyMode, BoxError, JsonTransactionIdStore, RecoveryConfig, RecoveryOrchestrator,
//!     TransactionApplier,
//! };
//! use gstore_log::CommandBatch;
//!
//! struct Storage;
//!
//! impl TransactionApplier for Storage {
//!     fn apply(&mut self, _batch: &CommandBatch, _mode: ApplyMode) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RecoveryConfig::for_store("./data");
//! let mut ids = JsonTransactionIdStore::open_in(&config.store_dir, None)?;
//! let mut storage = Storage;
//! let outcome = RecoveryOrchestrator::new(config, &mut storage, &mut ids).recover()?;
//! println!("{}", outcome.start);
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod decision;
pub mod error;
pub mod id_store;
pub mod locator;
pub mod orchestrator;
pub mod tail;
pub mod tracker;
pub mod truncator;

pub use collaborators::{
    AbortOracle, ApplyMode, ClosedTransaction, Lifecycle, LoggingRecoveryMonitor, NeverAbort,
    NoopRecoveryMonitor, ProgressReporter, RecoveryMonitor, SilentProgress, TransactionApplier,
    TransactionIdStore,
};
pub use config::{ConfigError, RecoveryConfig};
pub use decision::{RecoveryStartDecision, RecoveryStartInformation};
pub use error::{BoxError, RecoveryError};
pub use id_store::{
    InMemoryTransactionIdStore, JsonTransactionIdStore, TransactionIdState, TX_ID_STORE_FILE,
};
pub use locator::{CheckPointInfo, CheckPointLocator, LogTailInformation, INITIAL_LOG_VERSION};
pub use orchestrator::{
    locate_start, plan_recovery, RecoveryOrchestrator, RecoveryOutcome, RecoveryPlan,
    RecoveryState, RECOVERY_CHECK_POINT_REASON,
};
pub use tail::{compute_valid_tail, ValidTail};
pub use tracker::TransactionIdTracker;
pub use truncator::CorruptedLogsTruncator;
