//! Log writer.
//!
//! Appends batches and checkpoints to the highest log file, rotating to a
//! new version once the current file passes the rotation threshold. Every
//! batch is synced before `append_batch` returns.

use crate::cursor::{batch_checksum, BatchCursor};
use crate::entry::{
    CheckPointEntry, CommandEntry, CommitEntry, LogEntry, StartEntry, BATCH_FIRST, BATCH_LAST,
};
use crate::error::LogError;
use crate::files::{LogFile, LogFiles, LogVersion};
use crate::header::{LogHeader, StoreId};
use crate::position::LogPosition;
use crate::{TxId, BASE_TX_CHECKSUM, BASE_TX_ID, DEFAULT_ROTATION_THRESHOLD};
use bytes::Bytes;
use std::collections::HashMap;

/// A batch waiting to be written.
#[derive(Debug, Clone, Default)]
pub struct BatchDraft {
    pub commands: Vec<Bytes>,
    pub flags: u8,
    /// Owning transaction. `None` allocates a new id, which is only valid
    /// for a first batch.
    pub tx_id: Option<TxId>,
    pub additional_header: Bytes,
}

impl BatchDraft {
    /// A whole transaction in one batch.
    pub fn single(commands: Vec<Bytes>) -> Self {
        Self {
            commands,
            flags: BATCH_FIRST | BATCH_LAST,
            ..Default::default()
        }
    }

    /// First batch of a chunked transaction.
    pub fn first(commands: Vec<Bytes>) -> Self {
        Self {
            commands,
            flags: BATCH_FIRST,
            ..Default::default()
        }
    }

    /// Intermediate batch of a chunked transaction.
    pub fn middle(tx_id: TxId, commands: Vec<Bytes>) -> Self {
        Self {
            commands,
            flags: 0,
            tx_id: Some(tx_id),
            ..Default::default()
        }
    }

    /// Final batch of a chunked transaction.
    pub fn last(tx_id: TxId, commands: Vec<Bytes>) -> Self {
        Self {
            commands,
            flags: BATCH_LAST,
            tx_id: Some(tx_id),
            ..Default::default()
        }
    }

    pub fn with_additional_header(mut self, header: Bytes) -> Self {
        self.additional_header = header;
        self
    }
}

/// Where a batch landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedBatch {
    pub tx_id: TxId,
    pub start: LogPosition,
    pub end: LogPosition,
    pub checksum: u32,
    pub commit_timestamp: i64,
}

/// Appends to the transaction log.
pub struct LogWriter {
    files: LogFiles,
    store_id: StoreId,
    current: Option<LogFile>,
    rotation_threshold: u64,
    next_tx_id: TxId,
    last_committed_tx_id: TxId,
    last_checksum: u32,
    /// Next chunk index of each transaction whose last batch is not written yet.
    open_chains: HashMap<TxId, u32>,
}

impl LogWriter {
    /// Opens the log for writing, creating version 0 if no file exists.
    ///
    /// An existing log must belong to `store_id` and have a clean tail;
    /// recovery is responsible for making it so.
    pub fn open(files: LogFiles, store_id: StoreId) -> Result<Self, LogError> {
        let Some(highest) = files.highest_version()? else {
            let file = files.create(0, &LogHeader::new(store_id, BASE_TX_ID))?;
            tracing::debug!("created log file {}", file.path().display());
            return Ok(Self {
                files,
                store_id,
                current: Some(file),
                rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
                next_tx_id: BASE_TX_ID + 1,
                last_committed_tx_id: BASE_TX_ID,
                last_checksum: BASE_TX_CHECKSUM,
                open_chains: HashMap::new(),
            });
        };

        let header = files.read_header(highest)?;
        if header.store_id != store_id {
            return Err(LogError::InvalidHeader {
                path: files.path_for(highest),
                reason: format!(
                    "log belongs to store {}, expected {}",
                    header.store_id, store_id
                ),
            });
        }

        let lowest = files.lowest_version()?.unwrap_or(highest);
        let mut last_committed_tx_id = files.read_header(lowest)?.last_committed_tx_id;
        let mut max_tx_id = last_committed_tx_id;
        let mut last_checksum = BASE_TX_CHECKSUM;
        let mut open_chains = HashMap::new();

        let mut cursor = BatchCursor::open(&files, LogPosition::start_of(lowest))?;
        while let Some(batch) = cursor.next_batch()? {
            max_tx_id = max_tx_id.max(batch.tx_id());
            if batch.is_last() {
                last_committed_tx_id = last_committed_tx_id.max(batch.tx_id());
                open_chains.remove(&batch.tx_id());
            } else {
                open_chains.insert(batch.tx_id(), batch.chunk_index() + 1);
            }
            last_checksum = batch.checksum();
        }
        if let Some(corruption) = cursor.corruption() {
            return Err(LogError::InvalidBatch(format!(
                "log tail is not clean at {}: {}",
                corruption.position, corruption.reason
            )));
        }

        let current = files.open(highest)?;
        tracing::debug!(
            "opened log at version {} (last committed tx {})",
            highest,
            last_committed_tx_id
        );

        Ok(Self {
            files,
            store_id,
            current: Some(current),
            rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
            next_tx_id: max_tx_id + 1,
            last_committed_tx_id,
            last_checksum,
            open_chains,
        })
    }

    pub fn with_rotation_threshold(mut self, bytes: u64) -> Self {
        self.rotation_threshold = bytes;
        self
    }

    pub fn files(&self) -> &LogFiles {
        &self.files
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn last_committed_tx_id(&self) -> TxId {
        self.last_committed_tx_id
    }

    pub fn last_checksum(&self) -> u32 {
        self.last_checksum
    }

    pub fn next_tx_id(&self) -> TxId {
        self.next_tx_id
    }

    pub fn current_version(&self) -> Result<LogVersion, LogError> {
        Ok(self.file()?.version())
    }

    /// Position the next entry will be written at.
    pub fn current_position(&self) -> Result<LogPosition, LogError> {
        Ok(self.file()?.end_position())
    }

    /// Appends a whole transaction as a single batch.
    pub fn append_transaction(&mut self, commands: Vec<Bytes>) -> Result<AppendedBatch, LogError> {
        self.append_batch(BatchDraft::single(commands))
    }

    /// Appends one batch: Start, the commands, then Commit.
    pub fn append_batch(&mut self, draft: BatchDraft) -> Result<AppendedBatch, LogError> {
        let is_first = draft.flags & BATCH_FIRST != 0;
        let tx_id = match draft.tx_id {
            Some(id) => id,
            None if is_first => self.next_tx_id,
            None => {
                return Err(LogError::InvalidBatch(
                    "continuation batch needs the id of its transaction".to_string(),
                ))
            }
        };

        let chunk_index = if is_first {
            0
        } else {
            self.open_chains.get(&tx_id).copied().ok_or_else(|| {
                LogError::InvalidBatch(format!("transaction {} has no open chain", tx_id))
            })?
        };

        if self.file()?.size() >= self.rotation_threshold {
            self.rotate()?;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let start = StartEntry {
            master_id: 0,
            author_id: 0,
            time_written: now,
            last_committed_tx_id: self.last_committed_tx_id,
            previous_checksum: self.last_checksum,
            additional_header: draft.additional_header,
            batch_flags: draft.flags,
        };
        let start = LogEntry::Start(start);
        let start_payload = start.encode_payload();
        let commands: Vec<LogEntry> = draft
            .commands
            .into_iter()
            .map(|payload| LogEntry::Command(CommandEntry { payload }))
            .collect();
        let command_payloads: Vec<_> = commands.iter().map(LogEntry::encode_payload).collect();

        let checksum = batch_checksum(
            self.last_checksum,
            std::iter::once(&start_payload[..]).chain(command_payloads.iter().map(|p| &p[..])),
        );
        let commit = LogEntry::Commit(CommitEntry {
            tx_id,
            time_written: now,
            checksum,
            chunk_index,
            batch_flags: draft.flags,
        });

        let start_position = self.append_entry(&start)?;
        for command in &commands {
            self.append_entry(command)?;
        }
        self.append_entry(&commit)?;
        self.sync()?;

        let end = self.current_position()?;
        self.last_checksum = checksum;
        self.next_tx_id = self.next_tx_id.max(tx_id + 1);
        if draft.flags & BATCH_LAST != 0 {
            self.last_committed_tx_id = self.last_committed_tx_id.max(tx_id);
            self.open_chains.remove(&tx_id);
        } else {
            self.open_chains.insert(tx_id, chunk_index + 1);
        }

        Ok(AppendedBatch {
            tx_id,
            start: start_position,
            end,
            checksum,
            commit_timestamp: now,
        })
    }

    /// Writes a checkpoint entry and syncs. Returns the position past it.
    pub fn check_point(
        &mut self,
        target: LogPosition,
        reason: impl Into<String>,
    ) -> Result<LogPosition, LogError> {
        let entry = LogEntry::CheckPoint(CheckPointEntry {
            target,
            time_written: chrono::Utc::now().timestamp_millis(),
            reason: reason.into(),
        });
        self.append_entry(&entry)?;
        self.sync()?;
        self.current_position()
    }

    /// Appends a single framed entry without any batch bookkeeping.
    ///
    /// Returns the position the entry was written at.
    pub fn append_entry(&mut self, entry: &LogEntry) -> Result<LogPosition, LogError> {
        let frame = entry.encode()?;
        let file = self.file_mut()?;
        let offset = file.append(&frame)?;
        Ok(LogPosition::new(file.version(), offset))
    }

    /// Seals the current file and starts the next version.
    pub fn rotate(&mut self) -> Result<LogVersion, LogError> {
        let file = self.file_mut()?;
        file.sync()?;
        let next = file.version() + 1;

        let header = LogHeader::new(self.store_id, self.last_committed_tx_id);
        let created = self.files.create(next, &header)?;
        crate::files::sync_dir(self.files.dir())?;
        self.current = Some(created);

        tracing::debug!("rotated log to version {}", next);
        Ok(next)
    }

    pub fn sync(&mut self) -> Result<(), LogError> {
        self.file_mut()?.sync()
    }

    /// Syncs and closes the writer. Further writes fail with `Closed`.
    pub fn close(&mut self) -> Result<(), LogError> {
        if let Some(mut file) = self.current.take() {
            file.sync()?;
        }
        Ok(())
    }

    fn file(&self) -> Result<&LogFile, LogError> {
        self.current.as_ref().ok_or(LogError::Closed)
    }

    fn file_mut(&mut self) -> Result<&mut LogFile, LogError> {
        self.current.as_mut().ok_or(LogError::Closed)
    }
}
