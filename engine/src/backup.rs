//! Backup operations.
//!
//! Create, overwrite, restore and delete backups of a mounted save root.
//! A backup is either a directory tree or a single `.zip` archive; both carry
//! the metadata sidecar describing the container they came from.
//!
//! Restore order matters on a real device: the current save is backed up,
//! the container is resized, the root is wiped and committed, and only then
//! is the backup copied in.

use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::channel::CancelToken;
use crate::config::EngineConfig;
use crate::copy::CopyOptions;
use crate::error::EngineError;
use crate::filter::PathFilter;
use crate::journal::MIN_JOURNAL_LIMIT;
use crate::meta::{resolve_sizing, ContainerSizing, SaveInfo, SaveMetaRecord, SAVE_META_NAME};
use crate::model::{OperationKind, TransferReport};
use crate::progress::ProgressSink;
use crate::reader::ReaderPool;
use crate::walker::{enumerate_directory, DirectoryRoot, TreeDestination, TreeSource, TreeWalker};

/// Prefix of backups taken automatically before a restore.
pub const AUTO_BACKUP_PREFIX: &str = "AUTO";

/// Result of a restore.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub report: TransferReport,

    /// The backup's sidecar, if it was present and valid
    pub meta: Option<SaveMetaRecord>,

    /// Sizing the container was prepared with
    pub sizing: ContainerSizing,

    /// Safety backup taken before the save was wiped
    pub auto_backup: Option<PathBuf>,
}

/// Counts for a directory tree, sidecar excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryInfo {
    pub directories: u64,
    pub files: u64,
    pub total_bytes: u64,
}

impl DirectoryInfo {
    pub fn is_empty(&self) -> bool {
        self.directories == 0 && self.files == 0
    }
}

/// Entry point for whole-save operations. Owns the reader pool shared by
/// every transfer it runs.
pub struct BackupEngine {
    config: EngineConfig,
    pool: ReaderPool,
    filter: Option<PathFilter>,
    cancel: CancelToken,
}

impl BackupEngine {
    /// # Errors
    /// Returns EngineError::Config if the configuration is out of range or
    /// the reader pool cannot start
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let pool = ReaderPool::new(config.reader_threads)?;
        Ok(BackupEngine {
            config,
            pool,
            filter: None,
            cancel: CancelToken::new(),
        })
    }

    /// Paths excluded from backup, restore and wipe.
    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = Some(filter).filter(PathFilter::has_paths);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token that cancels whatever operation is running.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn walker<'a>(&'a self, progress: Option<&'a dyn ProgressSink>) -> TreeWalker<'a> {
        let options = CopyOptions {
            buffer_size: self.config.buffer_size,
            cancel: self.cancel.clone(),
        };
        TreeWalker::new(&self.pool, options)
            .with_progress(progress)
            .with_filter(self.filter.as_ref())
            .store_directories(self.config.store_directories)
    }

    /// Back up `save_root` into `target`.
    ///
    /// A `.zip` target produces an archive, anything else a directory. When
    /// `save_info` is given the sidecar is written first.
    ///
    /// # Errors
    /// Returns EngineError if the save root is missing, the target cannot be
    /// created, or a fatal error stops the walk. Per-file failures are in the
    /// returned report.
    pub fn create_backup(
        &self,
        save_root: &Path,
        target: &Path,
        save_info: Option<&SaveInfo>,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<TransferReport, EngineError> {
        self.run_backup(OperationKind::Backup, save_root, target, save_info, progress)
    }

    /// Replace an existing backup with the current save data.
    pub fn overwrite_backup(
        &self,
        save_root: &Path,
        target: &Path,
        save_info: Option<&SaveInfo>,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<TransferReport, EngineError> {
        if target.exists() {
            delete_backup(target)?;
        }
        self.run_backup(OperationKind::Overwrite, save_root, target, save_info, progress)
    }

    fn run_backup(
        &self,
        kind: OperationKind,
        save_root: &Path,
        target: &Path,
        save_info: Option<&SaveInfo>,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<TransferReport, EngineError> {
        if !save_root.is_dir() {
            return Err(EngineError::SourceNotFound {
                path: save_root.to_path_buf(),
            });
        }
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut report = TransferReport::new(kind, save_root, target);
        report.start();
        info!(kind = %kind, source = %save_root.display(), target = %target.display(), "backup started");

        let walker = self.walker(progress);
        let result = if is_archive_path(target) {
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }

            let mut writer = ArchiveWriter::create(target, self.config.zip_compression_level)?;
            if let Some(info) = save_info {
                if let Err(e) = write_archive_meta(&mut writer, info) {
                    warn!(target = %target.display(), error = %e, "save metadata not written");
                }
            }
            let walked = walker.copy_tree(
                TreeSource::Directory(save_root),
                TreeDestination::Archive(&mut writer),
                &mut report,
            );
            // The central directory is written even after a failed walk so the
            // entries that made it stay readable.
            let finished = writer.finish();
            walked.and(finished)
        } else {
            fs::create_dir_all(target).map_err(|e| EngineError::DirectoryCreationFailed {
                path: target.to_path_buf(),
                source: e,
            })?;
            if let Some(info) = save_info {
                if let Err(e) = SaveMetaRecord::new(info).write_to_dir(target) {
                    warn!(target = %target.display(), error = %e, "save metadata not written");
                }
            }
            let root = DirectoryRoot::new(target);
            walker.copy_tree(
                TreeSource::Directory(save_root),
                TreeDestination::Directory(&root),
                &mut report,
            )
        };

        finish_report(&mut report, result)?;
        Ok(report)
    }

    /// Restore `backup` into `save_root`.
    ///
    /// # Arguments
    /// * `backup` - Backup directory or `.zip` archive
    /// * `save_root` - Mounted save root; journaled for transactional devices
    /// * `defaults` - Title sizing used when the backup has no valid sidecar
    /// * `progress` - Optional progress sink
    ///
    /// # Errors
    /// EmptyBackup when the backup holds nothing but its sidecar. Wipe and
    /// fatal copy errors abort the restore.
    pub fn restore_backup(
        &self,
        backup: &Path,
        save_root: &DirectoryRoot,
        defaults: ContainerSizing,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<RestoreOutcome, EngineError> {
        if !backup.exists() {
            return Err(EngineError::SourceNotFound {
                path: backup.to_path_buf(),
            });
        }
        if !backup_has_contents(backup)? {
            return Err(EngineError::EmptyBackup {
                path: backup.to_path_buf(),
            });
        }
        info!(backup = %backup.display(), save = %save_root.path().display(), "restore started");

        let auto_backup = self.auto_backup(backup, save_root.path())?;

        let meta = match read_backup_meta(backup) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(backup = %backup.display(), error = %e, "ignoring save metadata");
                None
            }
        };
        let sizing = resolve_sizing(meta.as_ref(), defaults);

        // Journal sized by the container the data came from, when known
        let target = match save_root.journal() {
            Some(journal) => {
                if let Err(e) = journal.device().ensure_capacity(&sizing) {
                    warn!(device = journal.device().name(), error = %e, "could not resize save container");
                }
                let limit = u64::try_from(sizing.journal_size)
                    .ok()
                    .filter(|l| *l >= MIN_JOURNAL_LIMIT)
                    .unwrap_or(journal.limit());
                DirectoryRoot::journaled(save_root.path(), journal.with_limit(limit)?)
            }
            None => save_root.clone(),
        };

        let mut report = TransferReport::new(OperationKind::Restore, backup, save_root.path());
        report.start();

        wipe_root(target.path(), self.filter.as_ref())?;
        if target.commit()? {
            report.commits += 1;
        }
        debug!(save = %target.path().display(), "save root wiped");

        let walker = self.walker(progress);
        let result = if is_archive_path(backup) {
            let mut reader = ArchiveReader::open(backup)?;
            walker.copy_tree(
                TreeSource::Archive(&mut reader),
                TreeDestination::Directory(&target),
                &mut report,
            )
        } else {
            walker.copy_tree(
                TreeSource::Directory(backup),
                TreeDestination::Directory(&target),
                &mut report,
            )
        };

        finish_report(&mut report, result)?;
        Ok(RestoreOutcome {
            report,
            meta,
            sizing,
            auto_backup,
        })
    }

    fn auto_backup(&self, backup: &Path, save_root: &Path) -> Result<Option<PathBuf>, EngineError> {
        if !self.config.auto_backup_on_restore || !save_root.is_dir() {
            return Ok(None);
        }
        if directory_info(save_root)?.is_empty() {
            return Ok(None);
        }

        let name = backup_name(AUTO_BACKUP_PREFIX, Local::now(), self.config.export_to_zip);
        let path = backup
            .parent()
            .map(|p| p.join(&name))
            .unwrap_or_else(|| PathBuf::from(&name));
        let report = self.create_backup(save_root, &path, None, None)?;
        if !report.is_success() {
            warn!(
                path = %path.display(),
                failed = report.failures().count(),
                "automatic backup is incomplete"
            );
        }
        info!(path = %path.display(), "automatic backup created");
        Ok(Some(path))
    }
}

fn finish_report(report: &mut TransferReport, result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Ok(()) => {
            report.finish(false);
            info!(
                kind = %report.kind,
                files = report.files.len(),
                failed = report.failures().count(),
                bytes = report.total_bytes_written,
                commits = report.commits,
                "operation finished"
            );
            Ok(())
        }
        Err(e) => {
            report.finish(true);
            error!(kind = %report.kind, error = %e, "operation aborted");
            Err(e)
        }
    }
}

fn write_archive_meta(writer: &mut ArchiveWriter, info: &SaveInfo) -> Result<(), EngineError> {
    let bytes = SaveMetaRecord::new(info).to_bytes()?;
    writer.begin_entry(SAVE_META_NAME, bytes.len() as u64)?;
    writer.write(&bytes).map_err(|e| EngineError::WriteError {
        path: writer.path().join(SAVE_META_NAME),
        source: e,
    })
}

/// Read the sidecar of a backup directory or archive.
///
/// # Returns
/// None if the backup has no sidecar
///
/// # Errors
/// FormatError for a malformed sidecar, I/O errors otherwise
pub fn read_backup_meta(backup: &Path) -> Result<Option<SaveMetaRecord>, EngineError> {
    if is_archive_path(backup) {
        let mut reader = ArchiveReader::open(backup)?;
        match reader.read_named(SAVE_META_NAME)? {
            Some(bytes) => SaveMetaRecord::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    } else {
        SaveMetaRecord::read_from_dir(backup)
    }
}

/// Remove everything under `root` except filtered paths.
fn wipe_root(root: &Path, filter: Option<&PathFilter>) -> Result<(), EngineError> {
    if !root.exists() {
        return Ok(());
    }

    fn recurse(dir: &Path, prefix: &str, filter: Option<&PathFilter>) -> Result<(), EngineError> {
        let entries = fs::read_dir(dir).map_err(|e| EngineError::EnumerationFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::EnumerationFailed {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };

            if filter.map_or(false, |f| f.is_filtered(&relative)) {
                continue;
            }

            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let removed = if is_dir {
                // Keep directories that hold filtered paths
                recurse(&path, &relative, filter)?;
                let emptied = fs::read_dir(&path)
                    .map(|mut rest| rest.next().is_none())
                    .unwrap_or(true);
                if emptied {
                    fs::remove_dir(&path)
                } else {
                    Ok(())
                }
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| EngineError::DeleteFailed { path, source: e })?;
        }
        Ok(())
    }

    recurse(root, "", filter)
}

/// Delete a backup directory tree or archive.
pub fn delete_backup(target: &Path) -> Result<(), EngineError> {
    let metadata = fs::metadata(target).map_err(|_| EngineError::SourceNotFound {
        path: target.to_path_buf(),
    })?;
    let result = if metadata.is_dir() {
        fs::remove_dir_all(target)
    } else {
        fs::remove_file(target)
    };
    result.map_err(|e| EngineError::DeleteFailed {
        path: target.to_path_buf(),
        source: e,
    })?;
    info!(target = %target.display(), "backup deleted");
    Ok(())
}

/// `"<prefix> - YYYY-MM-DD_HH-MM-SS"`, with `.zip` appended for archives.
pub fn backup_name(prefix: &str, now: DateTime<Local>, zip: bool) -> String {
    let mut name = format!("{} - {}", prefix, now.format("%Y-%m-%d_%H-%M-%S"));
    if zip {
        name.push_str(".zip");
    }
    name
}

/// True for paths ending in `.zip`, case-insensitively.
pub fn is_archive_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("zip"))
}

/// True if the backup holds anything besides its sidecar.
pub fn backup_has_contents(backup: &Path) -> Result<bool, EngineError> {
    if is_archive_path(backup) {
        return ArchiveReader::open(backup)?.has_contents();
    }
    let entries = fs::read_dir(backup).map_err(|e| EngineError::EnumerationFailed {
        path: backup.to_path_buf(),
        source: e,
    })?;
    Ok(entries
        .filter_map(Result::ok)
        .any(|entry| entry.file_name() != SAVE_META_NAME))
}

/// Count directories, files and bytes below `root`.
pub fn directory_info(root: &Path) -> Result<DirectoryInfo, EngineError> {
    let mut info = DirectoryInfo::default();
    for entry in enumerate_directory(root, &PathFilter::default())? {
        if entry.is_dir {
            info.directories += 1;
        } else {
            info.files += 1;
            info.total_bytes += entry.size;
        }
    }
    Ok(info)
}
