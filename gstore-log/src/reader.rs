//! Sequential entry reader for a single log file.
//!
//! Entries are read strictly in order. A partial or invalid entry is not an
//! error: it ends the stream with [`ReadOutcome::Unreadable`], which callers
//! treat as a corrupt tail to be quarantined. Nothing after it is read.

use crate::entry::{FrameHeader, LogEntry};
use crate::error::LogError;
use crate::files::{LogFiles, LogVersion};
use crate::header::LogHeader;
use crate::position::LogPosition;
use crate::{ENTRY_HEADER_SIZE, LOG_HEADER_SIZE};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// An entry together with where it lives in the log.
#[derive(Debug, Clone)]
pub struct PositionedEntry {
    /// Position of the first byte of the entry frame.
    pub position: LogPosition,
    /// Position just past the entry frame.
    pub end: LogPosition,
    pub entry: LogEntry,
    /// Raw payload bytes, used for batch checksums.
    pub payload: Bytes,
}

/// Result of reading one entry.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    Entry(PositionedEntry),
    /// Clean end of the file at an entry boundary.
    EndOfFile(LogPosition),
    /// Bytes at `position` do not form a valid entry.
    Unreadable { position: LogPosition, reason: String },
}

/// Reads entries one at a time from a log file.
pub struct LogEntryReader {
    version: LogVersion,
    path: PathBuf,
    header: LogHeader,
    reader: BufReader<File>,
    offset: u64,
    finished: Option<ReadOutcome>,
}

impl LogEntryReader {
    /// Opens the file for `position.log_version` and positions the reader at
    /// `position.byte_offset`.
    pub fn open(files: &LogFiles, position: LogPosition) -> Result<Self, LogError> {
        if position.byte_offset < LOG_HEADER_SIZE {
            return Err(LogError::PositionInHeader(position));
        }

        let version = position.log_version;
        let header = files.read_header(version)?;
        let path = files.path_for(version);
        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LogError::FileNotFound(version)
            } else {
                LogError::file_io(&path, e)
            }
        })?;
        file.seek(SeekFrom::Start(position.byte_offset))
            .map_err(|e| LogError::file_io(&path, e))?;

        Ok(Self {
            version,
            path,
            header,
            reader: BufReader::new(file),
            offset: position.byte_offset,
            finished: None,
        })
    }

    /// Opens a reader at the first entry of a file.
    pub fn open_at_start(files: &LogFiles, version: LogVersion) -> Result<Self, LogError> {
        Self::open(files, LogPosition::start_of(version))
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position of the next entry to be read.
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.version, self.offset)
    }

    /// Reads the next entry.
    ///
    /// Once the stream has ended (cleanly or not) the same outcome is
    /// returned on every subsequent call.
    pub fn next_entry(&mut self) -> Result<ReadOutcome, LogError> {
        if let Some(done) = &self.finished {
            return Ok(done.clone());
        }

        let outcome = self.read_one()?;
        match &outcome {
            ReadOutcome::Entry(entry) => self.offset = entry.end.byte_offset,
            done => self.finished = Some(done.clone()),
        }
        Ok(outcome)
    }

    fn read_one(&mut self) -> Result<ReadOutcome, LogError> {
        let position = self.position();

        let mut raw_header = [0u8; ENTRY_HEADER_SIZE];
        let n = self.read_fully(&mut raw_header)?;
        if n == 0 {
            return Ok(ReadOutcome::EndOfFile(position));
        }
        if n < ENTRY_HEADER_SIZE {
            return Ok(unreadable(
                position,
                format!("incomplete entry header: {} of {} bytes", n, ENTRY_HEADER_SIZE),
            ));
        }

        let header = match FrameHeader::parse(&raw_header) {
            Ok(header) => header,
            Err(reason) => return Ok(unreadable(position, reason)),
        };

        let mut payload = vec![0u8; header.payload_len];
        let n = self.read_fully(&mut payload)?;
        if n < header.payload_len {
            return Ok(unreadable(
                position,
                format!("incomplete payload: {} of {} bytes", n, header.payload_len),
            ));
        }

        let actual = crc32c::crc32c(&payload);
        if actual != header.crc32c {
            return Ok(unreadable(
                position,
                format!(
                    "CRC mismatch (expected {:#x}, got {:#x})",
                    header.crc32c, actual
                ),
            ));
        }

        let payload = Bytes::from(payload);
        let entry = match LogEntry::decode_payload(&header, payload.clone()) {
            Ok(entry) => entry,
            Err(reason) => return Ok(unreadable(position, reason)),
        };

        let end = position.advance((ENTRY_HEADER_SIZE + header.payload_len) as u64);
        Ok(ReadOutcome::Entry(PositionedEntry {
            position,
            end,
            entry,
            payload,
        }))
    }

    /// Reads until `buf` is full or EOF, returning the number of bytes read.
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize, LogError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LogError::file_io(&self.path, e)),
            }
        }
        Ok(filled)
    }
}

fn unreadable(position: LogPosition, reason: String) -> ReadOutcome {
    ReadOutcome::Unreadable { position, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{CommandEntry, LogEntry};
    use crate::header::StoreId;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(files: &LogFiles, entries: &[LogEntry]) -> Vec<LogPosition> {
        let mut file = files
            .create(0, &LogHeader::new(StoreId::new(1, 1), 1))
            .unwrap();
        let mut positions = Vec::new();
        for entry in entries {
            let offset = file.append(&entry.encode().unwrap()).unwrap();
            positions.push(LogPosition::new(0, offset));
        }
        file.sync().unwrap();
        positions
    }

    fn command(data: &'static [u8]) -> LogEntry {
        LogEntry::Command(CommandEntry {
            payload: Bytes::from_static(data),
        })
    }

    #[test]
    fn test_reads_entries_then_clean_eof() {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        let positions = write_file(&files, &[command(b"a"), command(b"bb")]);

        let mut reader = LogEntryReader::open_at_start(&files, 0).unwrap();
        for expected in &positions {
            match reader.next_entry().unwrap() {
                ReadOutcome::Entry(e) => assert_eq!(e.position, *expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        let end = files.end_position().unwrap().unwrap();
        assert!(matches!(reader.next_entry().unwrap(), ReadOutcome::EndOfFile(p) if p == end));
        assert!(matches!(reader.next_entry().unwrap(), ReadOutcome::EndOfFile(_)));
    }

    #[test]
    fn test_partial_entry_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        let positions = write_file(&files, &[command(b"first"), command(b"second")]);

        let size = files.file_size(0).unwrap();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(files.path_for(0))
            .unwrap();
        file.set_len(size - 2).unwrap();

        let mut reader = LogEntryReader::open_at_start(&files, 0).unwrap();
        assert!(matches!(reader.next_entry().unwrap(), ReadOutcome::Entry(_)));
        match reader.next_entry().unwrap() {
            ReadOutcome::Unreadable { position, reason } => {
                assert_eq!(position, positions[1]);
                assert!(reason.contains("incomplete payload"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reader.position(), positions[1]);
    }

    #[test]
    fn test_garbage_is_unreadable_not_error() {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        let positions = write_file(&files, &[command(b"ok")]);

        let mut raw = std::fs::OpenOptions::new()
            .append(true)
            .open(files.path_for(0))
            .unwrap();
        raw.write_all(&[0xFFu8; 40]).unwrap();

        let mut reader = LogEntryReader::open(&files, positions[0]).unwrap();
        assert!(matches!(reader.next_entry().unwrap(), ReadOutcome::Entry(_)));
        assert!(matches!(
            reader.next_entry().unwrap(),
            ReadOutcome::Unreadable { .. }
        ));
    }

    #[test]
    fn test_position_inside_header_rejected() {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        write_file(&files, &[]);
        let result = LogEntryReader::open(&files, LogPosition::new(0, 3));
        assert!(matches!(result, Err(LogError::PositionInHeader(_))));
    }
}
