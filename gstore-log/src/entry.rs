//! Log entry types.
//!
//! Each entry has the following on-disk format:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | kind     | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | payload                                                         |
//! | length bytes                                                    |
//! +-----------------------------------------------------------------+
//! ```
//!
//! The flags byte carries the batch role of Start and Commit entries.

use crate::error::LogError;
use crate::position::LogPosition;
use crate::{TxId, ENTRY_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes for log entries: "GENT"
pub const ENTRY_MAGIC: [u8; 4] = *b"GENT";

/// Maximum entry payload size (16 MiB).
pub const MAX_ENTRY_SIZE: usize = 16 * 1024 * 1024;

/// Batch flag: first batch of its transaction.
pub const BATCH_FIRST: u8 = 0x01;

/// Batch flag: last batch of its transaction.
pub const BATCH_LAST: u8 = 0x02;

/// Kind of log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Start = 1,
    Command = 2,
    Commit = 3,
    CheckPoint = 4,
}

impl TryFrom<u8> for EntryKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EntryKind::Start),
            2 => Ok(EntryKind::Command),
            3 => Ok(EntryKind::Commit),
            4 => Ok(EntryKind::CheckPoint),
            other => Err(other),
        }
    }
}

/// Opens a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartEntry {
    pub master_id: i32,
    pub author_id: i32,
    pub time_written: i64,
    pub last_committed_tx_id: TxId,
    /// Checksum of the batch written before this one.
    pub previous_checksum: u32,
    pub additional_header: Bytes,
    pub batch_flags: u8,
}

/// Opaque command payload; the storage engine owns its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub payload: Bytes,
}

/// Closes a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub tx_id: TxId,
    pub time_written: i64,
    /// CRC32C over the batch's Start and Command payloads, seeded with
    /// the Start's previous checksum.
    pub checksum: u32,
    /// Zero-based index of this batch within its transaction.
    pub chunk_index: u32,
    pub batch_flags: u8,
}

/// Asserts that everything before `target` is durable in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPointEntry {
    pub target: LogPosition,
    pub time_written: i64,
    pub reason: String,
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Start(StartEntry),
    Command(CommandEntry),
    Commit(CommitEntry),
    CheckPoint(CheckPointEntry),
}

/// Parsed entry frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub kind: EntryKind,
    pub flags: u8,
    pub payload_len: usize,
    pub crc32c: u32,
}

impl FrameHeader {
    /// Parses a frame header. The error is a human-readable reason the
    /// bytes cannot be an entry.
    pub fn parse(buf: &[u8; ENTRY_HEADER_SIZE]) -> Result<Self, String> {
        let mut buf = &buf[..];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != ENTRY_MAGIC {
            return Err(format!("invalid magic: {:?}", magic));
        }

        let kind = EntryKind::try_from(buf.get_u8())
            .map_err(|raw| format!("unknown entry kind: {}", raw))?;
        let flags = buf.get_u8();
        buf.advance(2);
        let payload_len = buf.get_u32() as usize;
        let crc32c = buf.get_u32();

        if payload_len > MAX_ENTRY_SIZE {
            return Err(format!(
                "payload length {} exceeds maximum {}",
                payload_len, MAX_ENTRY_SIZE
            ));
        }

        Ok(Self {
            kind,
            flags,
            payload_len,
            crc32c,
        })
    }
}

impl LogEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            LogEntry::Start(_) => EntryKind::Start,
            LogEntry::Command(_) => EntryKind::Command,
            LogEntry::Commit(_) => EntryKind::Commit,
            LogEntry::CheckPoint(_) => EntryKind::CheckPoint,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            LogEntry::Start(start) => start.batch_flags,
            LogEntry::Commit(commit) => commit.batch_flags,
            _ => 0,
        }
    }

    /// Encodes the entry payload (without framing).
    pub fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            LogEntry::Start(start) => {
                buf.put_i32(start.master_id);
                buf.put_i32(start.author_id);
                buf.put_i64(start.time_written);
                buf.put_u64(start.last_committed_tx_id);
                buf.put_u32(start.previous_checksum);
                buf.put_u32(start.additional_header.len() as u32);
                buf.put_slice(&start.additional_header);
            }
            LogEntry::Command(command) => {
                buf.put_slice(&command.payload);
            }
            LogEntry::Commit(commit) => {
                buf.put_u64(commit.tx_id);
                buf.put_i64(commit.time_written);
                buf.put_u32(commit.checksum);
                buf.put_u32(commit.chunk_index);
            }
            LogEntry::CheckPoint(checkpoint) => {
                buf.put_u64(checkpoint.target.log_version);
                buf.put_u64(checkpoint.target.byte_offset);
                buf.put_i64(checkpoint.time_written);
                buf.put_u32(checkpoint.reason.len() as u32);
                buf.put_slice(checkpoint.reason.as_bytes());
            }
        }
        buf
    }

    /// Encodes the entry into a complete frame.
    pub fn encode(&self) -> Result<BytesMut, LogError> {
        let payload = self.encode_payload();
        if payload.len() > MAX_ENTRY_SIZE {
            return Err(LogError::EntryTooLarge {
                size: payload.len(),
                max: MAX_ENTRY_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(ENTRY_HEADER_SIZE + payload.len());

        // Magic (4 bytes)
        buf.put_slice(&ENTRY_MAGIC);

        // Kind (1 byte)
        buf.put_u8(self.kind() as u8);

        // Flags (1 byte)
        buf.put_u8(self.flags());

        // Reserved (2 bytes)
        buf.put_u16(0);

        // Payload length (4 bytes)
        buf.put_u32(payload.len() as u32);

        // CRC32C (4 bytes)
        buf.put_u32(crc32c::crc32c(&payload));

        buf.put_slice(&payload);
        Ok(buf)
    }

    /// Decodes a payload whose frame CRC has already been verified.
    pub fn decode_payload(header: &FrameHeader, mut payload: Bytes) -> Result<Self, String> {
        let entry = match header.kind {
            EntryKind::Start => {
                need(&payload, 32, "start")?;
                let master_id = payload.get_i32();
                let author_id = payload.get_i32();
                let time_written = payload.get_i64();
                let last_committed_tx_id = payload.get_u64();
                let previous_checksum = payload.get_u32();
                let header_len = payload.get_u32() as usize;
                need(&payload, header_len, "start additional header")?;
                let additional_header = payload.split_to(header_len);
                LogEntry::Start(StartEntry {
                    master_id,
                    author_id,
                    time_written,
                    last_committed_tx_id,
                    previous_checksum,
                    additional_header,
                    batch_flags: header.flags,
                })
            }
            EntryKind::Command => LogEntry::Command(CommandEntry { payload }),
            EntryKind::Commit => {
                need(&payload, 24, "commit")?;
                LogEntry::Commit(CommitEntry {
                    tx_id: payload.get_u64(),
                    time_written: payload.get_i64(),
                    checksum: payload.get_u32(),
                    chunk_index: payload.get_u32(),
                    batch_flags: header.flags,
                })
            }
            EntryKind::CheckPoint => {
                need(&payload, 28, "checkpoint")?;
                let log_version = payload.get_u64();
                let byte_offset = payload.get_u64();
                let time_written = payload.get_i64();
                let reason_len = payload.get_u32() as usize;
                need(&payload, reason_len, "checkpoint reason")?;
                let reason = String::from_utf8(payload.split_to(reason_len).to_vec())
                    .map_err(|e| format!("checkpoint reason is not UTF-8: {}", e))?;
                LogEntry::CheckPoint(CheckPointEntry {
                    target: LogPosition::new(log_version, byte_offset),
                    time_written,
                    reason,
                })
            }
        };
        Ok(entry)
    }
}

fn need(payload: &Bytes, len: usize, what: &str) -> Result<(), String> {
    if payload.remaining() < len {
        return Err(format!(
            "{} payload truncated: need {} bytes, have {}",
            what,
            len,
            payload.remaining()
        ));
    }
    Ok(())
}
