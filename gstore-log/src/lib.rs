//! # gstore-log
//!
//! Transaction log for gstore.
//!
//! This crate provides the on-disk log that recovery works from:
//! - `<prefix>.<version>` files with a fixed header
//! - Self-delimiting, CRC-protected entries
//! - Sequential readers that report unreadable tails instead of failing
//! - Batch cursors (forward and most-recent-first)
//! - A writer for the commit path and for building fixtures

pub mod cursor;
pub mod entry;
pub mod error;
pub mod files;
pub mod header;
pub mod position;
pub mod reader;
pub mod writer;

pub use cursor::{batch_checksum, BatchCursor, CommandBatch, ReversedBatchCursor, TailCorruption};
pub use entry::{
    CheckPointEntry, CommandEntry, CommitEntry, EntryKind, LogEntry, StartEntry, BATCH_FIRST,
    BATCH_LAST,
};
pub use error::LogError;
pub use files::{LogFile, LogFiles, LogVersion};
pub use header::{LogHeader, StoreId};
pub use position::LogPosition;
pub use reader::{LogEntryReader, PositionedEntry, ReadOutcome};
pub use writer::{AppendedBatch, BatchDraft, LogWriter};

/// Transaction identifier.
pub type TxId = u64;

/// Sentinel for "no transaction".
pub const NO_TRANSACTION_ID: TxId = 0;

/// Id of the last transaction of an empty store.
pub const BASE_TX_ID: TxId = 1;

/// Checksum seed of the first transaction in a store.
pub const BASE_TX_CHECKSUM: u32 = 0xDEAD_BEEF;

/// Log file header size in bytes.
pub const LOG_HEADER_SIZE: u64 = 32;

/// Entry frame header size in bytes.
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Default log file name prefix.
pub const DEFAULT_LOG_PREFIX: &str = "transaction.db";

/// Default rotation threshold (256 MiB).
pub const DEFAULT_ROTATION_THRESHOLD: u64 = 256 * 1024 * 1024;
