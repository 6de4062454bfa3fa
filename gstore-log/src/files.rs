//! Log file set management.
//!
//! The log is split into versioned files named `<prefix>.<version>`:
//! - Versions are contiguous; a gap means a file went missing
//! - The highest version is the only writable file
//! - Every file starts with a [`LogHeader`]

use crate::error::LogError;
use crate::header::LogHeader;
use crate::position::LogPosition;
use crate::LOG_HEADER_SIZE;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Log file version (monotonically increasing).
pub type LogVersion = u64;

/// The set of log files in one directory sharing a prefix.
#[derive(Debug, Clone)]
pub struct LogFiles {
    dir: PathBuf,
    prefix: String,
}

impl LogFiles {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// File name for a version: `<prefix>.<version>`.
    pub fn file_name(&self, version: LogVersion) -> String {
        format!("{}.{}", self.prefix, version)
    }

    /// Parses the version out of a file name belonging to this set.
    pub fn parse_version(&self, name: &str) -> Option<LogVersion> {
        let suffix = name.strip_prefix(&self.prefix)?.strip_prefix('.')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }

    pub fn path_for(&self, version: LogVersion) -> PathBuf {
        self.dir.join(self.file_name(version))
    }

    pub fn exists(&self, version: LogVersion) -> bool {
        self.path_for(version).is_file()
    }

    /// Lists all versions present in the directory, sorted ascending.
    pub fn versions(&self) -> Result<Vec<LogVersion>, LogError> {
        let mut versions = Vec::new();

        if !self.dir.exists() {
            return Ok(versions);
        }

        for entry in std::fs::read_dir(&self.dir).map_err(|e| LogError::file_io(&self.dir, e))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(version) = self.parse_version(&name) {
                if entry.file_type()?.is_file() {
                    versions.push(version);
                }
            }
        }

        versions.sort_unstable();
        Ok(versions)
    }

    pub fn lowest_version(&self) -> Result<Option<LogVersion>, LogError> {
        Ok(self.versions()?.first().copied())
    }

    pub fn highest_version(&self) -> Result<Option<LogVersion>, LogError> {
        Ok(self.versions()?.last().copied())
    }

    /// Returns the versions absent between the lowest present version and
    /// `max(highest present, expected_highest)`.
    pub fn missing_versions(
        &self,
        expected_highest: Option<LogVersion>,
    ) -> Result<Vec<LogVersion>, LogError> {
        let versions = self.versions()?;
        let Some(&lowest) = versions.first() else {
            return Ok(Vec::new());
        };
        let highest = versions
            .last()
            .copied()
            .unwrap_or(lowest)
            .max(expected_highest.unwrap_or(lowest));

        Ok((lowest..=highest)
            .filter(|v| versions.binary_search(v).is_err())
            .collect())
    }

    pub fn file_size(&self, version: LogVersion) -> Result<u64, LogError> {
        let path = self.path_for(version);
        let meta = std::fs::metadata(&path).map_err(|e| LogError::file_io(&path, e))?;
        Ok(meta.len())
    }

    /// Position just past the last byte of the highest file.
    pub fn end_position(&self) -> Result<Option<LogPosition>, LogError> {
        match self.highest_version()? {
            Some(version) => Ok(Some(LogPosition::new(version, self.file_size(version)?))),
            None => Ok(None),
        }
    }

    /// Reads and validates the header of a file.
    pub fn read_header(&self, version: LogVersion) -> Result<LogHeader, LogError> {
        let path = self.path_for(version);
        let mut file = File::open(&path).map_err(|e| not_found_or_io(version, &path, e))?;
        let mut buf = Vec::with_capacity(LOG_HEADER_SIZE as usize);
        (&mut file)
            .take(LOG_HEADER_SIZE)
            .read_to_end(&mut buf)
            .map_err(|e| LogError::file_io(&path, e))?;
        LogHeader::decode(&buf, &path)
    }

    /// Creates a new file with the given header.
    pub fn create(&self, version: LogVersion, header: &LogHeader) -> Result<LogFile, LogError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| LogError::file_io(&self.dir, e))?;
        LogFile::create(self.path_for(version), version, header)
    }

    /// Opens an existing file for reading and appending.
    pub fn open(&self, version: LogVersion) -> Result<LogFile, LogError> {
        LogFile::open(self.path_for(version), version)
    }
}

fn not_found_or_io(version: LogVersion, path: &Path, e: std::io::Error) -> LogError {
    if e.kind() == std::io::ErrorKind::NotFound {
        LogError::FileNotFound(version)
    } else {
        LogError::file_io(path, e)
    }
}

/// Fsyncs a directory so renames, creations and deletions in it are durable.
pub fn sync_dir(dir: &Path) -> Result<(), LogError> {
    let handle = File::open(dir).map_err(|e| LogError::file_io(dir, e))?;
    handle.sync_all().map_err(|e| LogError::file_io(dir, e))
}

/// A single open log file.
pub struct LogFile {
    version: LogVersion,
    path: PathBuf,
    file: File,
    size: u64,
    sync_pending: bool,
}

impl LogFile {
    fn create(path: PathBuf, version: LogVersion, header: &LogHeader) -> Result<Self, LogError> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| LogError::file_io(&path, e))?;

        file.write_all(&header.encode())
            .and_then(|_| file.sync_all())
            .map_err(|e| LogError::file_io(&path, e))?;

        Ok(Self {
            version,
            path,
            file,
            size: LOG_HEADER_SIZE,
            sync_pending: false,
        })
    }

    fn open(path: PathBuf, version: LogVersion) -> Result<Self, LogError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| not_found_or_io(version, &path, e))?;
        let size = file
            .metadata()
            .map_err(|e| LogError::file_io(&path, e))?
            .len();

        Ok(Self {
            version,
            path,
            file,
            size,
            sync_pending: false,
        })
    }

    pub fn version(&self) -> LogVersion {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Position just past the last byte of this file.
    pub fn end_position(&self) -> LogPosition {
        LogPosition::new(self.version, self.size)
    }

    /// Appends raw bytes, returning the offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, LogError> {
        let offset = self.size;
        self.file
            .seek(SeekFrom::End(0))
            .and_then(|_| self.file.write_all(bytes))
            .map_err(|e| LogError::file_io(&self.path, e))?;
        self.size += bytes.len() as u64;
        self.sync_pending = true;
        Ok(offset)
    }

    /// Syncs the file to disk.
    pub fn sync(&mut self) -> Result<(), LogError> {
        if self.sync_pending {
            self.file
                .sync_data()
                .map_err(|e| LogError::file_io(&self.path, e))?;
            self.sync_pending = false;
        }
        Ok(())
    }

    /// Reads everything from `offset` to the end of the file.
    pub fn read_from(&mut self, offset: u64) -> Result<Vec<u8>, LogError> {
        let mut buf = Vec::with_capacity(self.size.saturating_sub(offset) as usize);
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_to_end(&mut buf))
            .map_err(|e| LogError::file_io(&self.path, e))?;
        Ok(buf)
    }

    /// Truncates the file at the given offset and syncs it.
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), LogError> {
        self.file
            .set_len(offset)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| LogError::file_io(&self.path, e))?;
        self.size = offset;
        self.sync_pending = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::StoreId;
    use tempfile::TempDir;

    fn header() -> LogHeader {
        LogHeader::new(StoreId::new(1, 2), 1)
    }

    #[test]
    fn test_file_name() {
        let files = LogFiles::new("/tmp", "transaction.db");
        assert_eq!(files.file_name(0), "transaction.db.0");
        assert_eq!(files.file_name(255), "transaction.db.255");
    }

    #[test]
    fn test_parse_version() {
        let files = LogFiles::new("/tmp", "transaction.db");
        assert_eq!(files.parse_version("transaction.db.0"), Some(0));
        assert_eq!(files.parse_version("transaction.db.17"), Some(17));
        assert_eq!(files.parse_version("transaction.db."), None);
        assert_eq!(files.parse_version("transaction.db.x1"), None);
        assert_eq!(files.parse_version("transaction.db.1.zip"), None);
        assert_eq!(files.parse_version("other.db.1"), None);
    }

    #[test]
    fn test_versions_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        for v in [2, 0, 1] {
            files.create(v, &header()).unwrap();
        }
        std::fs::write(dir.path().join("tx.notes"), b"ignored").unwrap();

        assert_eq!(files.versions().unwrap(), vec![0, 1, 2]);
        assert_eq!(files.lowest_version().unwrap(), Some(0));
        assert_eq!(files.highest_version().unwrap(), Some(2));
    }

    #[test]
    fn test_missing_versions() {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        assert!(files.missing_versions(Some(3)).unwrap().is_empty());

        for v in [1, 3] {
            files.create(v, &header()).unwrap();
        }
        assert_eq!(files.missing_versions(None).unwrap(), vec![2]);
        assert_eq!(files.missing_versions(Some(5)).unwrap(), vec![2, 4, 5]);
    }

    #[test]
    fn test_create_append_truncate() {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        let mut file = files.create(0, &header()).unwrap();
        assert_eq!(file.size(), LOG_HEADER_SIZE);

        let offset = file.append(b"hello world").unwrap();
        assert_eq!(offset, LOG_HEADER_SIZE);
        file.sync().unwrap();
        assert_eq!(file.read_from(offset + 6).unwrap(), b"world");

        file.truncate_at(offset + 5).unwrap();
        assert_eq!(files.file_size(0).unwrap(), LOG_HEADER_SIZE + 5);
        assert_eq!(
            files.end_position().unwrap(),
            Some(LogPosition::new(0, LOG_HEADER_SIZE + 5))
        );
        assert_eq!(files.read_header(0).unwrap(), header());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let files = LogFiles::new(dir.path(), "tx");
        assert!(matches!(files.open(4), Err(LogError::FileNotFound(4))));
    }
}
