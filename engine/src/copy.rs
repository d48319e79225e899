//! Single-file copy engine.
//!
//! A transfer moves one file between a host path and an archive entry (or
//! between two host paths). The source is read by a `ReaderPool` worker while
//! the calling thread writes, so reads of the next buffer overlap the write of
//! the current one. On journaled destinations the writer commits the device
//! before the journal fills.
//!
//! Stages: Idle -> Opening -> Streaming -> (Committing)* -> Closing -> Done,
//! with Failed reachable from every stage after Idle.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::channel::{ByteChannel, CancelToken};
use crate::config::DEFAULT_BUFFER_SIZE;
use crate::error::EngineError;
use crate::journal::{Journal, JournalController};
use crate::progress::ProgressSink;
use crate::reader::{ReadSource, ReaderPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStage {
    Idle,
    Opening,
    Streaming,
    Committing,
    Closing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Bytes per producer read
    pub buffer_size: usize,

    /// Checked at every buffer handoff and commit
    pub cancel: CancelToken,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            buffer_size: DEFAULT_BUFFER_SIZE,
            cancel: CancelToken::new(),
        }
    }
}

/// Where a transfer reads from.
pub enum CopySource<'a> {
    Path(&'a Path),
    ArchiveEntry {
        archive: &'a mut ArchiveReader,
        index: usize,
    },
}

/// Where a transfer writes to.
pub enum CopyDestination<'a> {
    /// A host file, optionally on a journaled save device
    Path {
        path: &'a Path,
        journal: Option<&'a Journal>,
    },
    ArchiveEntry {
        archive: &'a mut ArchiveWriter,
        name: &'a str,
    },
}

/// Goal and current byte counts of the running transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CopyProgress {
    pub goal: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes_written: u64,
    pub commits: u32,
    /// Highest uncommitted byte count seen; always below the journal limit
    pub peak_uncommitted: u64,
}

enum Sink<'a> {
    File {
        file: Option<File>,
        path: PathBuf,
        journal: Option<&'a Journal>,
    },
    Entry {
        archive: &'a mut ArchiveWriter,
        name: String,
    },
}

impl Sink<'_> {
    fn label(&self) -> PathBuf {
        match self {
            Sink::File { path, .. } => path.clone(),
            Sink::Entry { archive, name } => archive.path().join(name),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let result = match self {
            Sink::File { file: Some(file), .. } => file.write_all(bytes),
            Sink::File { file: None, .. } => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "destination is closed",
            )),
            Sink::Entry { archive, .. } => archive.write(bytes),
        };
        result.map_err(|e| EngineError::WriteError {
            path: self.label(),
            source: e,
        })
    }
    /// Undo a transfer that will not complete. Host files are cut back to
    /// the bytes actually written; archive entries are dropped.
    fn abandon(self, written: u64) {
        match self {
            Sink::File { file, path, .. } => {
                let trimmed = match file {
                    Some(file) => file.set_len(written),
                    None => OpenOptions::new()
                        .write(true)
                        .open(&path)
                        .and_then(|file| file.set_len(written)),
                };
                if let Err(e) = trimmed {
                    warn!(path = %path.display(), error = %e, "partial file not trimmed");
                }
            }
            Sink::Entry { archive, name } => {
                if let Err(e) = archive.abort_entry() {
                    warn!(entry = %name, error = %e, "partial entry not discarded");
                }
            }
        }
    }
}

/// Per-transfer counters owned by the consumer.
struct StreamState {
    controller: JournalController,
    written: u64,
    commits: u32,
}

pub struct CopyEngine<'a> {
    pool: &'a ReaderPool,
    options: CopyOptions,
    observer: Option<&'a dyn ProgressSink>,
    stage: CopyStage,
    progress: CopyProgress,
}

impl<'a> CopyEngine<'a> {
    pub fn new(pool: &'a ReaderPool, options: CopyOptions, observer: Option<&'a dyn ProgressSink>) -> Self {
        CopyEngine {
            pool,
            options,
            observer,
            stage: CopyStage::Idle,
            progress: CopyProgress::default(),
        }
    }

    pub fn stage(&self) -> CopyStage {
        self.stage
    }

    pub fn progress(&self) -> CopyProgress {
        self.progress
    }

    fn set_stage(&mut self, stage: CopyStage) {
        if self.stage != stage {
            debug!(from = ?self.stage, to = ?stage, "copy stage");
            self.stage = stage;
        }
    }

    fn fail(&mut self, err: EngineError) -> EngineError {
        self.set_stage(CopyStage::Failed);
        if err.is_fatal() {
            error!(error = %err, "transfer aborted");
        }
        err
    }

    fn report(&mut self, written: u64) {
        self.progress.current = written as f64;
        if let Some(observer) = self.observer {
            observer.update_current(self.progress.current);
        }
    }

    /// Copy one file from `source` to `destination`.
    ///
    /// # Returns
    /// Bytes written, commits performed and the uncommitted high-water mark
    ///
    /// # Errors
    /// Open, read and write failures concern this file only. CommitError,
    /// ReopenError and Cancelled are fatal to the surrounding operation.
    pub fn transfer(
        &mut self,
        source: CopySource<'_>,
        destination: CopyDestination<'_>,
    ) -> Result<CopyOutcome, EngineError> {
        self.set_stage(CopyStage::Opening);
        self.progress = CopyProgress::default();

        if let (CopySource::ArchiveEntry { .. }, CopyDestination::ArchiveEntry { archive, .. }) =
            (&source, &destination)
        {
            let err = EngineError::InvalidPath {
                path: archive.path().to_path_buf(),
                reason: "cannot copy directly between two archives".to_string(),
            };
            return Err(self.fail(err));
        }
        if self.options.cancel.is_cancelled() {
            return Err(self.fail(EngineError::Cancelled));
        }

        let (read_source, size, source_label, mut lender) = match open_source(source) {
            Ok(opened) => opened,
            Err(e) => return Err(self.fail(e)),
        };

        let mut sink = match open_destination(destination, size) {
            Ok(sink) => sink,
            Err(e) => {
                if let (Some(reader), ReadSource::Entry { archive, .. }) = (lender.take(), read_source) {
                    reader.restore(archive);
                }
                return Err(self.fail(e));
            }
        };

        self.progress.goal = size as f64;
        if let Some(observer) = self.observer {
            observer.reset(self.progress.goal);
        }

        let mut state = StreamState {
            controller: match &sink {
                Sink::File { journal: Some(journal), .. } => journal.controller(),
                _ => JournalController::new(0),
            },
            written: 0,
            commits: 0,
        };

        let channel = Arc::new(ByteChannel::new(self.options.buffer_size));
        let outcome = match self
            .pool
            .submit(read_source, Arc::clone(&channel), self.options.cancel.clone())
        {
            Ok(outcome) => outcome,
            Err(read_source) => {
                if let (Some(reader), ReadSource::Entry { archive, .. }) = (lender.take(), read_source) {
                    reader.restore(archive);
                }
                sink.abandon(0);
                let err = EngineError::ReadError {
                    path: source_label,
                    source: std::io::Error::other("reader pool is not running"),
                };
                return Err(self.fail(err));
            }
        };

        self.set_stage(CopyStage::Streaming);
        let drained = {
            let _consumer = channel.consumer_guard();
            self.drain(&channel, &mut sink, &mut state)
        };

        // Join the producer and take the lent source back before anything else.
        let produced = match outcome.recv() {
            Ok(done) => {
                if let (Some(reader), ReadSource::Entry { archive, .. }) = (lender.take(), done.source) {
                    reader.restore(archive);
                }
                done.result
            }
            Err(_) => Err(std::io::Error::other("producer exited without reporting")),
        };

        let failure = match (drained, produced) {
            (Err(e), _) => Some(e),
            (Ok(()), Err(_)) if self.options.cancel.is_cancelled() => Some(EngineError::Cancelled),
            (Ok(()), Err(e)) => Some(EngineError::ReadError {
                path: source_label,
                source: e,
            }),
            (Ok(()), Ok(_)) => None,
        };
        if let Some(err) = failure {
            sink.abandon(state.written);
            return Err(self.fail(err));
        }

        self.set_stage(CopyStage::Closing);
        if let Err(e) = self.close(sink, &mut state) {
            return Err(self.fail(e));
        }

        self.set_stage(CopyStage::Done);
        Ok(CopyOutcome {
            bytes_written: state.written,
            commits: state.commits,
            peak_uncommitted: state.controller.peak(),
        })
    }

    /// Consume payloads until the producer finishes.
    fn drain(&mut self, channel: &ByteChannel, sink: &mut Sink<'_>, state: &mut StreamState) -> Result<(), EngineError> {
        let mut buffer = Vec::with_capacity(channel.capacity());
        let max_chunk = state.controller.max_chunk();

        loop {
            if self.options.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if channel.take(&mut buffer).is_none() {
                return Ok(());
            }

            for chunk in buffer.chunks(max_chunk) {
                if state.controller.needs_commit(chunk.len() as u64) {
                    self.commit_window(sink, state)?;
                }
                sink.write(chunk)?;
                state.controller.accumulate(chunk.len() as u64);
                state.written += chunk.len() as u64;
                self.report(state.written);
            }
        }
    }

    /// Close, commit, reopen and seek back to the last written offset.
    fn commit_window(&mut self, sink: &mut Sink<'_>, state: &mut StreamState) -> Result<(), EngineError> {
        let Sink::File {
            file,
            path,
            journal: Some(journal),
        } = sink
        else {
            return Ok(());
        };

        self.set_stage(CopyStage::Committing);
        if self.options.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        drop(file.take());
        commit_device(*journal)?;

        let mut reopened = OpenOptions::new()
            .write(true)
            .open(&*path)
            .map_err(|e| EngineError::ReopenError {
                path: path.clone(),
                source: e,
            })?;
        reopened
            .seek(SeekFrom::Start(state.written))
            .map_err(|e| EngineError::ReopenError {
                path: path.clone(),
                source: e,
            })?;
        *file = Some(reopened);

        debug!(
            path = %path.display(),
            uncommitted = state.controller.written_since_commit(),
            offset = state.written,
            "journal committed"
        );
        state.controller.committed();
        state.commits += 1;
        self.set_stage(CopyStage::Streaming);
        Ok(())
    }

    /// Trim preallocation, close the handle and make the file durable.
    fn close(&mut self, sink: Sink<'_>, state: &mut StreamState) -> Result<(), EngineError> {
        let Sink::File { file, path, journal } = sink else {
            return Ok(());
        };

        if let Some(file) = file {
            file.set_len(state.written)
                .map_err(|e| EngineError::WriteError {
                    path: path.clone(),
                    source: e,
                })?;
        }

        if let Some(journal) = journal.filter(|j| j.is_enabled()) {
            if self.options.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            commit_device(journal)?;
            state.controller.committed();
            state.commits += 1;
        }
        Ok(())
    }
}

fn commit_device(journal: &Journal) -> Result<(), EngineError> {
    journal
        .device()
        .commit()
        .map_err(|e| EngineError::CommitError {
            device: journal.device().name().to_string(),
            source: e,
        })
}

type OpenedSource<'s> = (ReadSource, u64, PathBuf, Option<&'s mut ArchiveReader>);

fn open_source(source: CopySource<'_>) -> Result<OpenedSource<'_>, EngineError> {
    match source {
        CopySource::Path(path) => {
            if !path.exists() {
                return Err(EngineError::SourceNotFound {
                    path: path.to_path_buf(),
                });
            }
            let file = File::open(path).map_err(|e| EngineError::OpenError {
                path: path.to_path_buf(),
                source: e,
            })?;
            let size = file
                .metadata()
                .map_err(|e| EngineError::OpenError {
                    path: path.to_path_buf(),
                    source: e,
                })?
                .len();
            Ok((ReadSource::File(file), size, path.to_path_buf(), None))
        }
        CopySource::ArchiveEntry { archive, index } => {
            let info = archive.entry(index)?;
            let label = archive.path().join(&info.name);
            if info.is_dir {
                return Err(EngineError::InvalidPath {
                    path: label,
                    reason: "entry is a directory".to_string(),
                });
            }
            let zip = archive.lend()?;
            Ok((ReadSource::Entry { archive: zip, index }, info.size, label, Some(archive)))
        }
    }
}

fn open_destination(destination: CopyDestination<'_>, size_hint: u64) -> Result<Sink<'_>, EngineError> {
    match destination {
        CopyDestination::Path { path, journal } => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| EngineError::OpenError {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            file.set_len(size_hint).map_err(|e| EngineError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;
            Ok(Sink::File {
                file: Some(file),
                path: path.to_path_buf(),
                journal,
            })
        }
        CopyDestination::ArchiveEntry { archive, name } => {
            archive.begin_entry(name, size_hint)?;
            Ok(Sink::Entry {
                archive,
                name: name.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::RecordingDevice;
    use crate::progress::TaskProgress;
    use std::fs;

    fn pool() -> ReaderPool {
        ReaderPool::new(1).expect("Failed to start reader pool")
    }

    fn to_path<'a>(path: &'a Path, journal: Option<&'a Journal>) -> CopyDestination<'a> {
        CopyDestination::Path { path, journal }
    }

    #[test]
    fn test_small_file_copy_reports_progress() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("data.bin");
        let dst = temp_dir.path().join("copy.bin");
        fs::write(&src, [1u8, 2, 3]).expect("Failed to write source");

        let pool = pool();
        let progress = TaskProgress::new();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), Some(&progress));
        let outcome = engine
            .transfer(CopySource::Path(&src), to_path(&dst, None))
            .expect("Failed to copy");

        assert_eq!(outcome.bytes_written, 3);
        assert_eq!(outcome.commits, 0);
        assert_eq!(fs::read(&dst).expect("Failed to read copy"), vec![1, 2, 3]);
        assert_eq!(progress.current(), 3.0);
        assert_eq!(progress.goal(), 3.0);
        assert_eq!(engine.progress().current, 3.0);
        assert_eq!(engine.stage(), CopyStage::Done);
    }

    #[test]
    fn test_zero_length_source_completes() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("empty.bin");
        let dst = temp_dir.path().join("copy.bin");
        fs::write(&src, b"").expect("Failed to write source");

        let pool = pool();
        let progress = TaskProgress::new();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), Some(&progress));
        let outcome = engine
            .transfer(CopySource::Path(&src), to_path(&dst, None))
            .expect("Failed to copy");

        assert_eq!(outcome.bytes_written, 0);
        assert_eq!(progress.current(), 0.0);
        assert_eq!(progress.goal(), 0.0);
        assert_eq!(progress.progress(), 0.0);
        assert_eq!(fs::metadata(&dst).expect("Missing copy").len(), 0);
    }

    #[test]
    fn test_journaled_copy_commits_below_limit() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.bin");
        let dst = temp_dir.path().join("big_copy.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        fs::write(&src, &data).expect("Failed to write source");

        let device = Arc::new(RecordingDevice::new());
        let journal = Journal::new(100_000, device.clone()).expect("Failed to create journal");
        let pool = pool();
        let options = CopyOptions {
            buffer_size: 0x1000,
            ..CopyOptions::default()
        };
        let mut engine = CopyEngine::new(&pool, options, None);
        let outcome = engine
            .transfer(CopySource::Path(&src), to_path(&dst, Some(&journal)))
            .expect("Failed to copy");

        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert!(outcome.peak_uncommitted < journal.limit());
        assert!(outcome.commits >= 5, "only {} commits", outcome.commits);
        assert_eq!(device.commits(), outcome.commits as usize);
        assert_eq!(fs::read(&dst).expect("Failed to read copy"), data);
    }

    #[test]
    fn test_payload_larger_than_threshold_is_split() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.bin");
        let dst = temp_dir.path().join("big_copy.bin");
        let data = vec![0xA5u8; 40_000];
        fs::write(&src, &data).expect("Failed to write source");

        // Threshold 5000 is far below the 32 KiB read size.
        let device = Arc::new(RecordingDevice::new());
        let journal = Journal::new(10_000, device.clone()).expect("Failed to create journal");
        let pool = pool();
        let options = CopyOptions {
            buffer_size: 0x8000,
            ..CopyOptions::default()
        };
        let mut engine = CopyEngine::new(&pool, options, None);
        let outcome = engine
            .transfer(CopySource::Path(&src), to_path(&dst, Some(&journal)))
            .expect("Failed to copy");

        assert!(outcome.peak_uncommitted < 10_000);
        assert_eq!(fs::read(&dst).expect("Failed to read copy"), data);
    }

    #[test]
    fn test_commit_failure_is_fatal() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.bin");
        let dst = temp_dir.path().join("big_copy.bin");
        fs::write(&src, vec![7u8; 50_000]).expect("Failed to write source");

        let device = Arc::new(RecordingDevice::failing_from(1));
        let journal = Journal::new(20_000, device.clone()).expect("Failed to create journal");
        let pool = pool();
        let options = CopyOptions {
            buffer_size: 0x1000,
            ..CopyOptions::default()
        };
        let mut engine = CopyEngine::new(&pool, options, None);
        let err = engine
            .transfer(CopySource::Path(&src), to_path(&dst, Some(&journal)))
            .expect_err("Commit failure should abort");

        assert!(matches!(err, EngineError::CommitError { .. }));
        assert!(err.is_fatal());
        assert_eq!(engine.stage(), CopyStage::Failed);
    }

    #[test]
    fn test_file_to_entry_and_back() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("slot.bin");
        let zip_path = temp_dir.path().join("backup.zip");
        let restored = temp_dir.path().join("restored.bin");
        let data: Vec<u8> = (0..70_000u32).map(|i| (i * 7 % 256) as u8).collect();
        fs::write(&src, &data).expect("Failed to write source");

        let pool = pool();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), None);

        let mut writer = ArchiveWriter::create(&zip_path, 6).expect("Failed to create archive");
        engine
            .transfer(
                CopySource::Path(&src),
                CopyDestination::ArchiveEntry {
                    archive: &mut writer,
                    name: "slot.bin",
                },
            )
            .expect("Failed to copy into archive");
        writer.finish().expect("Failed to finish archive");

        let mut reader = ArchiveReader::open(&zip_path).expect("Failed to open archive");
        let outcome = engine
            .transfer(
                CopySource::ArchiveEntry {
                    archive: &mut reader,
                    index: 0,
                },
                to_path(&restored, None),
            )
            .expect("Failed to copy out of archive");

        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert_eq!(fs::read(&restored).expect("Failed to read restored"), data);
        // The archive came back from the producer.
        assert!(reader.entry(0).is_ok());
    }

    #[test]
    fn test_read_failure_trims_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        // Opening a directory succeeds but reading it fails.
        let src = temp_dir.path().join("not_a_file");
        fs::create_dir(&src).expect("Failed to create dir");
        let dst = temp_dir.path().join("copy.bin");

        let pool = pool();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), None);
        let err = engine
            .transfer(CopySource::Path(&src), to_path(&dst, None))
            .expect_err("Reading a directory should fail");

        assert!(matches!(err, EngineError::ReadError { .. }));
        assert!(!err.is_fatal());
        assert_eq!(engine.stage(), CopyStage::Failed);
        assert_eq!(fs::metadata(&dst).expect("Missing destination").len(), 0);
    }

    #[test]
    fn test_read_failure_on_journaled_destination_is_trimmed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("not_a_file");
        fs::create_dir(&src).expect("Failed to create dir");
        let dst = temp_dir.path().join("copy.bin");

        let device = Arc::new(RecordingDevice::new());
        let journal = Journal::new(0x10000, device.clone()).expect("Failed to create journal");
        let pool = pool();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), None);
        let err = engine
            .transfer(CopySource::Path(&src), to_path(&dst, Some(&journal)))
            .expect_err("Reading a directory should fail");

        assert!(matches!(err, EngineError::ReadError { .. }));
        assert_eq!(device.commits(), 0);
        assert_eq!(fs::metadata(&dst).expect("Missing destination").len(), 0);
    }

    #[test]
    fn test_read_failure_discards_archive_entry() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let good = temp_dir.path().join("good.bin");
        fs::write(&good, b"good").expect("Failed to write source");
        let bad = temp_dir.path().join("bad");
        fs::create_dir(&bad).expect("Failed to create dir");
        let zip_path = temp_dir.path().join("backup.zip");

        let pool = pool();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), None);
        let mut writer = ArchiveWriter::create(&zip_path, 6).expect("Failed to create archive");
        engine
            .transfer(
                CopySource::Path(&good),
                CopyDestination::ArchiveEntry {
                    archive: &mut writer,
                    name: "good.bin",
                },
            )
            .expect("Failed to copy into archive");
        let result = engine.transfer(
            CopySource::Path(&bad),
            CopyDestination::ArchiveEntry {
                archive: &mut writer,
                name: "slot.bin",
            },
        );
        assert!(matches!(result, Err(EngineError::ReadError { .. })));
        assert_eq!(writer.current_entry(), None);
        writer.finish().expect("Failed to finish archive");

        let mut reader = ArchiveReader::open(&zip_path).expect("Failed to open archive");
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.read_named("slot.bin").expect("Failed to read"), None);
        assert_eq!(reader.read_named("good.bin").expect("Failed to read"), Some(b"good".to_vec()));
    }

    #[test]
    fn test_archive_to_archive_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let zip_path = temp_dir.path().join("a.zip");
        let mut writer = ArchiveWriter::create(&zip_path, 6).expect("Failed to create archive");
        writer.begin_entry("a.bin", 1).expect("Failed to begin entry");
        writer.write(&[1]).expect("Failed to write entry");
        writer.finish().expect("Failed to finish archive");

        let mut reader = ArchiveReader::open(&zip_path).expect("Failed to open archive");
        let mut out = ArchiveWriter::create(&temp_dir.path().join("b.zip"), 6).expect("Failed to create archive");

        let pool = pool();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), None);
        let result = engine.transfer(
            CopySource::ArchiveEntry {
                archive: &mut reader,
                index: 0,
            },
            CopyDestination::ArchiveEntry {
                archive: &mut out,
                name: "a.bin",
            },
        );
        assert!(matches!(result, Err(EngineError::InvalidPath { .. })));
        assert!(reader.entry(0).is_ok());
    }

    #[test]
    fn test_missing_source_fails_before_streaming() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("copy.bin");

        let pool = pool();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), None);
        let result = engine.transfer(CopySource::Path(&temp_dir.path().join("nope")), to_path(&dst, None));

        assert!(matches!(result, Err(EngineError::SourceNotFound { .. })));
        assert_eq!(engine.stage(), CopyStage::Failed);
        assert!(!dst.exists());
    }

    #[test]
    fn test_unopenable_destination_restores_archive() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let zip_path = temp_dir.path().join("a.zip");
        let mut writer = ArchiveWriter::create(&zip_path, 6).expect("Failed to create archive");
        writer.begin_entry("a.bin", 1).expect("Failed to begin entry");
        writer.write(&[1]).expect("Failed to write entry");
        writer.finish().expect("Failed to finish archive");

        // A directory cannot be opened as a file.
        let blocked = temp_dir.path().join("blocked");
        fs::create_dir(&blocked).expect("Failed to create dir");

        let mut reader = ArchiveReader::open(&zip_path).expect("Failed to open archive");
        let pool = pool();
        let mut engine = CopyEngine::new(&pool, CopyOptions::default(), None);
        let result = engine.transfer(
            CopySource::ArchiveEntry {
                archive: &mut reader,
                index: 0,
            },
            to_path(&blocked, None),
        );

        assert!(matches!(result, Err(EngineError::OpenError { .. })));
        assert!(reader.entry(0).is_ok());
    }

    #[test]
    fn test_cancelled_transfer_is_fatal() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("data.bin");
        fs::write(&src, vec![1u8; 1024]).expect("Failed to write source");

        let options = CopyOptions::default();
        options.cancel.cancel();
        let pool = pool();
        let mut engine = CopyEngine::new(&pool, options, None);
        let err = engine
            .transfer(CopySource::Path(&src), to_path(&temp_dir.path().join("out.bin"), None))
            .expect_err("Cancelled transfer should fail");

        assert!(matches!(err, EngineError::Cancelled));
        assert!(err.is_fatal());
    }
}
