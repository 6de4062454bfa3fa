//! Batch cursors.
//!
//! A batch is `Start (Command)* Commit`, possibly spanning a file boundary.
//! [`BatchCursor`] yields batches in log order starting at a position and
//! stops at the first thing it cannot trust: an unreadable entry, a batch
//! whose checksum does not match, an out-of-place entry, or a batch that is
//! still open when the log ends. [`ReversedBatchCursor`] yields the same
//! batches most-recent-first.

use crate::entry::{CommandEntry, CommitEntry, LogEntry, StartEntry, BATCH_FIRST, BATCH_LAST};
use crate::error::LogError;
use crate::files::{LogFiles, LogVersion};
use crate::position::LogPosition;
use crate::reader::{LogEntryReader, PositionedEntry, ReadOutcome};
use crate::TxId;

/// One chunk of a transaction as found in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    pub start: StartEntry,
    pub commands: Vec<CommandEntry>,
    pub commit: CommitEntry,
    /// Position of the Start entry.
    pub start_position: LogPosition,
    /// Position just past the Commit entry.
    pub end_position: LogPosition,
}

impl CommandBatch {
    /// Id of the owning transaction.
    pub fn tx_id(&self) -> TxId {
        self.commit.tx_id
    }

    pub fn is_first(&self) -> bool {
        self.start.batch_flags & BATCH_FIRST != 0
    }

    pub fn is_last(&self) -> bool {
        self.start.batch_flags & BATCH_LAST != 0
    }

    /// Zero-based index of this batch within its transaction.
    pub fn chunk_index(&self) -> u32 {
        self.commit.chunk_index
    }

    pub fn checksum(&self) -> u32 {
        self.commit.checksum
    }

    pub fn commit_timestamp(&self) -> i64 {
        self.commit.time_written
    }
}

/// Computes a batch checksum over entry payloads.
pub fn batch_checksum<'a>(seed: u32, payloads: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    payloads
        .into_iter()
        .fold(seed, |crc, payload| crc32c::crc32c_append(crc, payload))
}

/// Where and why a cursor stopped before the physical end of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailCorruption {
    pub position: LogPosition,
    pub reason: String,
}

struct OpenBatch {
    start: StartEntry,
    start_position: LogPosition,
    commands: Vec<CommandEntry>,
    crc: u32,
}

/// Forward batch cursor.
pub struct BatchCursor {
    files: LogFiles,
    reader: Option<LogEntryReader>,
    highest: LogVersion,
    valid_position: LogPosition,
    corruption: Option<TailCorruption>,
}

impl BatchCursor {
    /// Opens a cursor at `from`, which must be an entry boundary.
    pub fn open(files: &LogFiles, from: LogPosition) -> Result<Self, LogError> {
        let highest = files.highest_version()?;
        let mut cursor = Self {
            files: files.clone(),
            reader: None,
            highest: highest.unwrap_or(0),
            valid_position: from,
            corruption: None,
        };

        match highest {
            Some(highest) if from.log_version <= highest => {
                match LogEntryReader::open(files, from) {
                    Ok(reader) => cursor.reader = Some(reader),
                    Err(LogError::InvalidHeader { path, reason }) if from.log_version == highest => {
                        // Nothing in a file without a header can be trusted.
                        tracing::warn!("unreadable header in {}: {}", path.display(), reason);
                        let at = LogPosition::new(from.log_version, 0);
                        cursor.valid_position = at;
                        cursor.stop(
                            at,
                            &format!("unreadable header in log version {}", from.log_version),
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => {}
        }
        Ok(cursor)
    }

    /// Position just past the last complete batch or checkpoint read so far.
    pub fn valid_position(&self) -> LogPosition {
        self.valid_position
    }

    /// Set once the cursor stopped on something it could not trust.
    pub fn corruption(&self) -> Option<&TailCorruption> {
        self.corruption.as_ref()
    }

    pub fn is_corrupted(&self) -> bool {
        self.corruption.is_some()
    }

    /// Reads the next complete batch, or `None` at the end of readable data.
    pub fn next_batch(&mut self) -> Result<Option<CommandBatch>, LogError> {
        let mut open: Option<OpenBatch> = None;

        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };

            match reader.next_entry()? {
                ReadOutcome::Entry(entry) => {
                    if let Some(batch) = self.accept(entry, &mut open)? {
                        return Ok(Some(batch));
                    }
                    if self.reader.is_none() {
                        return Ok(None);
                    }
                }
                ReadOutcome::EndOfFile(end) => {
                    if end.log_version >= self.highest {
                        if let Some(batch) = open.take() {
                            self.stop(batch.start_position, "incomplete batch at end of log");
                        } else {
                            self.reader = None;
                        }
                        return Ok(None);
                    }
                    self.advance_file(end, open.is_none())?;
                }
                ReadOutcome::Unreadable { position, reason } => {
                    tracing::debug!("unreadable entry at {}: {}", position, reason);
                    let at = open.as_ref().map_or(position, |b| b.start_position);
                    self.stop(at, &reason);
                    return Ok(None);
                }
            }
        }
    }

    fn accept(
        &mut self,
        positioned: PositionedEntry,
        open: &mut Option<OpenBatch>,
    ) -> Result<Option<CommandBatch>, LogError> {
        let PositionedEntry {
            position,
            end,
            entry,
            payload,
        } = positioned;

        match entry {
            LogEntry::Start(start) => {
                if let Some(previous) = open.as_ref() {
                    self.stop(previous.start_position, "start entry inside an open batch");
                    return Ok(None);
                }
                let crc = batch_checksum(start.previous_checksum, [payload.as_ref()]);
                *open = Some(OpenBatch {
                    start,
                    start_position: position,
                    commands: Vec::new(),
                    crc,
                });
            }
            LogEntry::Command(command) => match open.as_mut() {
                Some(batch) => {
                    batch.crc = batch_checksum(batch.crc, [payload.as_ref()]);
                    batch.commands.push(command);
                }
                None => self.stop(position, "command entry outside a batch"),
            },
            LogEntry::Commit(commit) => {
                let Some(batch) = open.take() else {
                    self.stop(position, "commit entry outside a batch");
                    return Ok(None);
                };
                if batch.crc != commit.checksum {
                    let reason = format!(
                        "batch checksum mismatch for tx {} (expected {:#x}, got {:#x})",
                        commit.tx_id, commit.checksum, batch.crc
                    );
                    self.stop(batch.start_position, &reason);
                    return Ok(None);
                }
                if batch.start.batch_flags != commit.batch_flags {
                    self.stop(batch.start_position, "start and commit disagree on batch role");
                    return Ok(None);
                }
                self.valid_position = end;
                return Ok(Some(CommandBatch {
                    start: batch.start,
                    commands: batch.commands,
                    commit,
                    start_position: batch.start_position,
                    end_position: end,
                }));
            }
            LogEntry::CheckPoint(_) => match open.as_ref() {
                Some(batch) => {
                    let at = batch.start_position;
                    self.stop(at, "checkpoint entry inside an open batch");
                }
                None => self.valid_position = end,
            },
        }
        Ok(None)
    }

    fn advance_file(&mut self, end: LogPosition, at_boundary: bool) -> Result<(), LogError> {
        let next = end.log_version + 1;
        match LogEntryReader::open_at_start(&self.files, next) {
            Ok(reader) => {
                if at_boundary {
                    self.valid_position = reader.position();
                }
                self.reader = Some(reader);
                Ok(())
            }
            Err(LogError::InvalidHeader { path, reason }) if next == self.highest => {
                // A crash during rotation can leave a half-written header.
                tracing::warn!("unreadable header in {}: {}", path.display(), reason);
                let at = if at_boundary { end } else { self.valid_position };
                self.stop(at, &format!("unreadable header in log version {}", next));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn stop(&mut self, position: LogPosition, reason: &str) {
        self.corruption = Some(TailCorruption {
            position,
            reason: reason.to_string(),
        });
        self.reader = None;
    }
}

impl Iterator for BatchCursor {
    type Item = Result<CommandBatch, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

/// Batch cursor yielding the most recent batch first.
///
/// Reads forward once to record batch boundaries, then re-reads each batch
/// on demand in reverse order. Never writes.
pub struct ReversedBatchCursor {
    files: LogFiles,
    starts: Vec<LogPosition>,
    valid_position: LogPosition,
    corruption: Option<TailCorruption>,
}

impl ReversedBatchCursor {
    pub fn open(files: &LogFiles, from: LogPosition) -> Result<Self, LogError> {
        let mut forward = BatchCursor::open(files, from)?;
        let mut starts = Vec::new();
        while let Some(batch) = forward.next_batch()? {
            starts.push(batch.start_position);
        }

        Ok(Self {
            files: files.clone(),
            starts,
            valid_position: forward.valid_position(),
            corruption: forward.corruption().cloned(),
        })
    }

    /// Number of batches left to yield.
    pub fn remaining(&self) -> usize {
        self.starts.len()
    }

    /// Valid end of the log as seen by the forward pass.
    pub fn valid_position(&self) -> LogPosition {
        self.valid_position
    }

    pub fn corruption(&self) -> Option<&TailCorruption> {
        self.corruption.as_ref()
    }

    pub fn next_batch(&mut self) -> Result<Option<CommandBatch>, LogError> {
        let Some(start) = self.starts.pop() else {
            return Ok(None);
        };
        let mut cursor = BatchCursor::open(&self.files, start)?;
        match cursor.next_batch()? {
            Some(batch) => Ok(Some(batch)),
            None => Err(LogError::InvalidBatch(format!(
                "batch at {} was readable on the forward pass but not on re-read",
                start
            ))),
        }
    }
}

impl Iterator for ReversedBatchCursor {
    type Item = Result<CommandBatch, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}
