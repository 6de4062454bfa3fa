//! Quarantining and removing the log tail.
//!
//! Everything past the truncation position is first copied into a zip
//! archive in the quarantine directory. The archive is synced before any
//! log file is touched, so a crash leaves either the originals or the
//! archive (usually both) on disk.

use crate::collaborators::RecoveryMonitor;
use crate::error::{BoxError, RecoveryError};
use gstore_log::files::sync_dir;
use gstore_log::{LogError, LogFiles, LogPosition, LogVersion};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A byte range of one log file that is about to be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PrunedRange {
    version: LogVersion,
    /// Offset the removed bytes start at (zero for whole files).
    offset: u64,
    len: u64,
    /// The file is deleted rather than truncated.
    whole: bool,
}

/// Makes the log end at a given position, archiving whatever is removed.
pub struct CorruptedLogsTruncator<'a> {
    files: LogFiles,
    quarantine_dir: PathBuf,
    monitor: &'a dyn RecoveryMonitor,
}

impl<'a> CorruptedLogsTruncator<'a> {
    pub fn new(
        files: LogFiles,
        quarantine_dir: impl Into<PathBuf>,
        monitor: &'a dyn RecoveryMonitor,
    ) -> Self {
        Self {
            files,
            quarantine_dir: quarantine_dir.into(),
            monitor,
        }
    }

    /// Truncates the log at `position`.
    ///
    /// A position at offset zero removes its whole file, header included.
    /// Returns the archive written, or `None` when nothing past `position`
    /// held any bytes. Calling it again with the same position is a no-op.
    pub fn truncate(&self, position: LogPosition) -> Result<Option<PathBuf>, RecoveryError> {
        let wrap = |source: LogError| RecoveryError::Truncate { position, source };

        let ranges = self.pruned_ranges(position).map_err(wrap)?;
        if ranges.is_empty() {
            return Ok(None);
        }

        let archive = if ranges.iter().any(|r| r.len > 0) {
            let archive = self.archive_path(position)?;
            self.monitor.archive_registered(&archive);
            self.monitor.archive_started(&archive);
            self.create_archive(&archive, &ranges)?;
            self.monitor.archive_finished(&archive);
            Some(archive)
        } else {
            None
        };

        self.prune(&ranges).map_err(wrap)?;

        let removed: u64 = ranges.iter().map(|r| r.len).sum();
        match &archive {
            Some(path) => tracing::warn!(
                "Truncated transaction log at {}: {} bytes moved to {}",
                position,
                removed,
                path.display()
            ),
            None => tracing::warn!("Removed empty log files after {}", position),
        }
        Ok(archive)
    }

    /// Ranges that still exist past `position`, in version order.
    fn pruned_ranges(&self, position: LogPosition) -> Result<Vec<PrunedRange>, LogError> {
        let mut ranges = Vec::new();

        if self.files.exists(position.log_version) {
            let size = self.files.file_size(position.log_version)?;
            if position.byte_offset == 0 {
                ranges.push(PrunedRange {
                    version: position.log_version,
                    offset: 0,
                    len: size,
                    whole: true,
                });
            } else if size > position.byte_offset {
                ranges.push(PrunedRange {
                    version: position.log_version,
                    offset: position.byte_offset,
                    len: size - position.byte_offset,
                    whole: false,
                });
            }
        }

        for version in self.files.versions()? {
            if version > position.log_version {
                ranges.push(PrunedRange {
                    version,
                    offset: 0,
                    len: self.files.file_size(version)?,
                    whole: true,
                });
            }
        }
        Ok(ranges)
    }

    /// `corrupted-<version>-<offset>-<millis>.zip`, with a counter appended
    /// if that name is taken.
    fn archive_path(&self, position: LogPosition) -> Result<PathBuf, RecoveryError> {
        std::fs::create_dir_all(&self.quarantine_dir).map_err(|e| RecoveryError::Archive {
            path: self.quarantine_dir.clone(),
            source: Box::new(e),
        })?;

        let base = format!(
            "corrupted-{}-{}-{}",
            position.log_version,
            position.byte_offset,
            chrono::Utc::now().timestamp_millis()
        );
        let mut path = self.quarantine_dir.join(format!("{}.zip", base));
        let mut attempt = 1;
        while path.exists() {
            path = self.quarantine_dir.join(format!("{}-{}.zip", base, attempt));
            attempt += 1;
        }
        Ok(path)
    }

    /// Creates `archive` and fills it. An existing file at that path is
    /// never touched; a partially written one is removed.
    fn create_archive(&self, archive: &Path, ranges: &[PrunedRange]) -> Result<(), RecoveryError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(archive)
            .map_err(|e| self.archive_failed(archive, Box::new(e)))?;

        if let Err(source) = self.write_archive(file, ranges) {
            match std::fs::remove_file(archive) {
                Ok(()) => tracing::debug!("Removed partial archive {}", archive.display()),
                Err(e) => tracing::warn!(
                    "Could not remove partial archive {}: {}",
                    archive.display(),
                    e
                ),
            }
            return Err(self.archive_failed(archive, source));
        }
        Ok(())
    }

    fn archive_failed(&self, archive: &Path, source: BoxError) -> RecoveryError {
        self.monitor.archive_failed(archive, &source.to_string());
        RecoveryError::Archive {
            path: archive.to_path_buf(),
            source,
        }
    }

    fn write_archive(&self, file: File, ranges: &[PrunedRange]) -> Result<(), BoxError> {
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        for range in ranges.iter().filter(|r| r.len > 0) {
            let path = self.files.path_for(range.version);
            let mut source = File::open(&path)?;
            source.seek(SeekFrom::Start(range.offset))?;

            zip.start_file(self.files.file_name(range.version), options)?;
            let copied = std::io::copy(&mut source, &mut zip)?;
            if copied != range.len {
                return Err(format!(
                    "{} changed while archiving: expected {} bytes, copied {}",
                    path.display(),
                    range.len,
                    copied
                )
                .into());
            }
        }

        let writer = zip.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        sync_dir(&self.quarantine_dir)?;
        Ok(())
    }

    /// Truncates the partially kept file, then deletes whole files highest
    /// version first.
    fn prune(&self, ranges: &[PrunedRange]) -> Result<(), LogError> {
        for range in ranges.iter().filter(|r| !r.whole) {
            let mut file = self.files.open(range.version)?;
            file.truncate_at(range.offset)?;
        }

        for range in ranges.iter().filter(|r| r.whole).rev() {
            let path = self.files.path_for(range.version);
            std::fs::remove_file(&path).map_err(|e| LogError::FileIo {
                path: path.clone(),
                source: e,
            })?;
            tracing::debug!("Removed log file {}", path.display());
        }

        sync_dir(self.files.dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoopRecoveryMonitor;
    use bytes::Bytes;
    use gstore_log::{LogWriter, StoreId};
    use parking_lot::Mutex;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    struct Fixture {
        dir: TempDir,
        files: LogFiles,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let files = LogFiles::new(dir.path(), "tx");
            Self { dir, files }
        }

        fn quarantine(&self) -> PathBuf {
            self.dir.path().join("corrupted-logs")
        }

        fn truncator(&self) -> CorruptedLogsTruncator<'static> {
            CorruptedLogsTruncator::new(self.files.clone(), self.quarantine(), &NoopRecoveryMonitor)
        }

        fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
            self.files
                .versions()
                .unwrap()
                .into_iter()
                .map(|v| {
                    (
                        self.files.file_name(v),
                        std::fs::read(self.files.path_for(v)).unwrap(),
                    )
                })
                .collect()
        }
    }

    fn write_log(files: &LogFiles, rotations: usize) -> Vec<LogPosition> {
        let mut log = LogWriter::open(files.clone(), StoreId::new(1, 1)).unwrap();
        let mut ends = Vec::new();
        for i in 0..=rotations {
            if i > 0 {
                log.rotate().unwrap();
            }
            for _ in 0..2 {
                let tx = log
                    .append_transaction(vec![Bytes::from_static(b"payload")])
                    .unwrap();
                ends.push(tx.end);
            }
        }
        log.close().unwrap();
        ends
    }

    fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut entry = archive.by_index(i).unwrap();
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).unwrap();
                (entry.name().to_string(), bytes)
            })
            .collect()
    }

    #[test]
    fn test_noop_at_end() {
        let fx = Fixture::new();
        let ends = write_log(&fx.files, 0);
        let truncator = fx.truncator();

        assert_eq!(truncator.truncate(*ends.last().unwrap()).unwrap(), None);
        assert_eq!(truncator.truncate(LogPosition::new(9, 0)).unwrap(), None);
        assert!(!fx.quarantine().exists());
    }

    #[test]
    fn test_truncation_is_complete() {
        let fx = Fixture::new();
        let ends = write_log(&fx.files, 2);
        let before = fx.snapshot();
        let cut = ends[2];
        assert_eq!(cut.log_version, 1);

        let truncator = fx.truncator();
        let archive = truncator.truncate(cut).unwrap().unwrap();
        assert!(archive
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("corrupted-1-{}-", cut.byte_offset)));

        assert_eq!(fx.files.versions().unwrap(), vec![0, 1]);
        assert_eq!(fx.files.end_position().unwrap(), Some(cut));

        let after = fx.snapshot();
        let archived = read_archive(&archive);
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0].0, "tx.1");
        assert_eq!(archived[1].0, "tx.2");

        let mut file1 = after[1].1.clone();
        file1.extend_from_slice(&archived[0].1);
        assert_eq!(file1, before[1].1);
        assert_eq!(archived[1].1, before[2].1);
        assert_eq!(after[0], before[0]);
    }

    #[test]
    fn test_truncate_twice_equals_once() {
        let fx = Fixture::new();
        let ends = write_log(&fx.files, 1);
        let truncator = fx.truncator();

        assert!(truncator.truncate(ends[0]).unwrap().is_some());
        let once = fx.snapshot();
        assert!(truncator.truncate(ends[0]).unwrap().is_none());
        assert_eq!(fx.snapshot(), once);
        assert_eq!(std::fs::read_dir(fx.quarantine()).unwrap().count(), 1);
    }

    #[test]
    fn test_cut_at_file_boundary_deletes_later_files() {
        let fx = Fixture::new();
        let ends = write_log(&fx.files, 1);
        let truncator = fx.truncator();

        let archive = truncator.truncate(ends[1]).unwrap().unwrap();
        assert_eq!(fx.files.versions().unwrap(), vec![0]);
        let archived = read_archive(&archive);
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].0, "tx.1");
    }

    #[derive(Default)]
    struct RecordingMonitor {
        events: Mutex<Vec<String>>,
    }

    impl RecoveryMonitor for RecordingMonitor {
        fn archive_registered(&self, _: &Path) {
            self.events.lock().push("registered".to_string());
        }
        fn archive_started(&self, _: &Path) {
            self.events.lock().push("started".to_string());
        }
        fn archive_finished(&self, _: &Path) {
            self.events.lock().push("finished".to_string());
        }
        fn archive_failed(&self, _: &Path, _: &str) {
            self.events.lock().push("failed".to_string());
        }
    }

    #[test]
    fn test_archive_events() {
        let fx = Fixture::new();
        let ends = write_log(&fx.files, 0);
        let monitor = RecordingMonitor::default();
        let truncator = CorruptedLogsTruncator::new(fx.files.clone(), fx.quarantine(), &monitor);

        truncator.truncate(ends[0]).unwrap();
        assert_eq!(
            *monitor.events.lock(),
            vec!["registered", "started", "finished"]
        );
    }

    #[test]
    fn test_archive_failure_leaves_log_untouched() {
        let fx = Fixture::new();
        let ends = write_log(&fx.files, 0);
        let before = fx.snapshot();
        // A regular file where the quarantine directory should be.
        std::fs::write(fx.quarantine(), b"in the way").unwrap();

        let truncator = fx.truncator();
        let result = truncator.truncate(ends[0]);
        assert!(matches!(result, Err(RecoveryError::Archive { .. })));
        assert_eq!(fx.snapshot(), before);
    }

    #[test]
    fn test_existing_archive_is_never_removed() {
        let fx = Fixture::new();
        let ends = write_log(&fx.files, 0);
        let before = fx.snapshot();
        std::fs::create_dir_all(fx.quarantine()).unwrap();
        let taken = fx.quarantine().join("taken.zip");
        std::fs::write(&taken, b"evidence").unwrap();

        let monitor = RecordingMonitor::default();
        let truncator = CorruptedLogsTruncator::new(fx.files.clone(), fx.quarantine(), &monitor);
        let ranges = truncator.pruned_ranges(ends[0]).unwrap();
        let result = truncator.create_archive(&taken, &ranges);

        assert!(matches!(result, Err(RecoveryError::Archive { path, .. }) if path == taken));
        assert_eq!(std::fs::read(&taken).unwrap(), b"evidence");
        assert_eq!(*monitor.events.lock(), vec!["failed"]);
        assert_eq!(fx.snapshot(), before);
    }

    #[test]
    fn test_position_at_file_start_removes_whole_file() {
        let fx = Fixture::new();
        std::fs::write(fx.files.path_for(0), b"GSTL\x01").unwrap();

        let truncator = fx.truncator();
        let archive = truncator.truncate(LogPosition::new(0, 0)).unwrap().unwrap();
        assert!(fx.files.versions().unwrap().is_empty());
        assert_eq!(
            read_archive(&archive),
            vec![("tx.0".to_string(), b"GSTL\x01".to_vec())]
        );

        assert!(truncator.truncate(LogPosition::new(0, 0)).unwrap().is_none());
    }
}
