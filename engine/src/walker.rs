//! Tree walking.
//!
//! Enumerates a source directory tree or archive and drives one `CopyEngine`
//! transfer per file. Per-file failures are recorded in the operation's
//! `TransferReport` and the walk moves on; fatal errors (failed commit,
//! cancellation) stop it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::archive::{sanitize_entry_name, ArchiveReader, ArchiveWriter};
use crate::copy::{CopyDestination, CopyEngine, CopyOptions, CopySource};
use crate::error::EngineError;
use crate::filter::PathFilter;
use crate::journal::Journal;
use crate::meta::SAVE_META_NAME;
use crate::model::{FileItem, TransferReport};
use crate::progress::ProgressSink;
use crate::reader::ReaderPool;

/// An opened directory root, optionally backed by a journaled save device.
#[derive(Debug, Clone)]
pub struct DirectoryRoot {
    path: PathBuf,
    journal: Option<Journal>,
}

impl DirectoryRoot {
    pub fn new(path: impl AsRef<Path>) -> Self {
        DirectoryRoot {
            path: path.as_ref().to_path_buf(),
            journal: None,
        }
    }

    /// A root whose writes go through `journal`'s device.
    pub fn journaled(path: impl AsRef<Path>, journal: Journal) -> Self {
        DirectoryRoot {
            path: path.as_ref().to_path_buf(),
            journal: Some(journal),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// Commit the owning device, if this root is journaled.
    ///
    /// # Returns
    /// True if a commit was performed
    pub fn commit(&self) -> Result<bool, EngineError> {
        match self.journal.as_ref().filter(|j| j.is_enabled()) {
            Some(journal) => {
                journal
                    .device()
                    .commit()
                    .map_err(|e| EngineError::CommitError {
                        device: journal.device().name().to_string(),
                        source: e,
                    })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub enum TreeSource<'a> {
    Directory(&'a Path),
    Archive(&'a mut ArchiveReader),
}

pub enum TreeDestination<'a> {
    Directory(&'a DirectoryRoot),
    Archive(&'a mut ArchiveWriter),
}

/// One enumerated file or directory.
#[derive(Debug)]
pub struct WalkEntry {
    /// Forward-slash path relative to the tree root
    pub relative_path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Archive member index; None for host files and inferred directories
    pub index: Option<usize>,
    /// Set when the entry cannot be processed (unreadable directory, unsafe name)
    pub failure: Option<EngineError>,
}

impl WalkEntry {
    fn new(relative_path: String, is_dir: bool, size: u64, index: Option<usize>) -> Self {
        WalkEntry {
            relative_path,
            is_dir,
            size,
            index,
            failure: None,
        }
    }
}

/// Enumerate a directory tree, depth-first pre-order in native order.
///
/// Subtrees of filtered directories are not descended into. An unreadable
/// subdirectory is returned with `failure` set and no children.
///
/// # Errors
/// Returns EngineError if the root itself cannot be enumerated
pub fn enumerate_directory(root: &Path, filter: &PathFilter) -> Result<Vec<WalkEntry>, EngineError> {
    if !root.exists() {
        return Err(EngineError::SourceNotFound {
            path: root.to_path_buf(),
        });
    }

    fn recurse(
        path: &Path,
        prefix: &str,
        filter: &PathFilter,
        entries: &mut Vec<WalkEntry>,
    ) -> Result<(), EngineError> {
        let read_dir = fs::read_dir(path).map_err(|e| EngineError::EnumerationFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        for entry in read_dir {
            let entry = entry.map_err(|e| EngineError::EnumerationFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
            let metadata = entry.metadata().map_err(|e| EngineError::EnumerationFailed {
                path: entry.path(),
                source: e,
            })?;

            let name = entry.file_name().to_string_lossy().into_owned();
            if !metadata.is_dir() && name == SAVE_META_NAME {
                continue;
            }
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };

            if metadata.is_dir() {
                entries.push(WalkEntry::new(relative.clone(), true, 0, None));
                if filter.is_filtered(&relative) {
                    continue;
                }

                // Record the error on the directory item and continue with siblings
                if let Err(e) = recurse(&entry.path(), &relative, filter, entries) {
                    warn!(path = %entry.path().display(), error = %e, "cannot enumerate directory");
                    let children = format!("{}/", relative);
                    entries.retain(|i| !i.relative_path.starts_with(&children));
                    if let Some(item) = entries.iter_mut().rev().find(|i| i.relative_path == relative) {
                        item.failure = Some(e);
                    }
                }
            } else {
                entries.push(WalkEntry::new(relative, false, metadata.len(), None));
            }
        }
        Ok(())
    }

    let mut entries = Vec::new();
    recurse(root, "", filter, &mut entries)?;
    Ok(entries)
}

/// Enumerate archive members in member order.
///
/// Parent directories are emitted once, before their first child, whether
/// or not the archive stores them explicitly. Unsafe names are returned
/// with `failure` set.
pub fn enumerate_archive(reader: &mut ArchiveReader) -> Result<Vec<WalkEntry>, EngineError> {
    let mut entries = Vec::new();
    let mut seen_dirs: HashSet<String> = HashSet::new();

    reader.reset();
    while let Some(info) = reader.read_next()? {
        let name = match sanitize_entry_name(&info.name) {
            Ok(name) => name,
            Err(e) => {
                let mut entry = WalkEntry::new(info.name.clone(), info.is_dir, info.size, Some(info.index));
                entry.failure = Some(e);
                entries.push(entry);
                continue;
            }
        };
        if !info.is_dir && name.rsplit('/').next() == Some(SAVE_META_NAME) {
            continue;
        }

        // Infer parents from the separators
        let mut parent = String::new();
        let components: Vec<&str> = name.split('/').collect();
        let dir_depth = if info.is_dir {
            components.len()
        } else {
            components.len() - 1
        };
        for component in &components[..dir_depth] {
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(component);
            if seen_dirs.insert(parent.clone()) {
                entries.push(WalkEntry::new(parent.clone(), true, 0, None));
            }
        }

        if !info.is_dir {
            entries.push(WalkEntry::new(name, false, info.size, Some(info.index)));
        }
    }
    reader.reset();
    Ok(entries)
}

/// Drives per-file transfers across a whole tree.
pub struct TreeWalker<'a> {
    pool: &'a ReaderPool,
    options: CopyOptions,
    progress: Option<&'a dyn ProgressSink>,
    filter: Option<&'a PathFilter>,
    store_directories: bool,
}

impl<'a> TreeWalker<'a> {
    pub fn new(pool: &'a ReaderPool, options: CopyOptions) -> Self {
        TreeWalker {
            pool,
            options,
            progress: None,
            filter: None,
            store_directories: true,
        }
    }

    pub fn with_progress(mut self, progress: Option<&'a dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_filter(mut self, filter: Option<&'a PathFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Keep directories as `name/` entries when writing archives.
    pub fn store_directories(mut self, store: bool) -> Self {
        self.store_directories = store;
        self
    }

    fn notify(&self, item: &FileItem) {
        if let Some(progress) = self.progress {
            progress.file_completed(item);
        }
    }

    /// Copy every entry of `source` into `destination`, recording each one
    /// in `report`.
    ///
    /// # Errors
    /// Returns EngineError for enumeration failures at the root and for
    /// fatal errors. File-level errors are recorded in the report.
    pub fn copy_tree(
        &self,
        mut source: TreeSource<'_>,
        mut destination: TreeDestination<'_>,
        report: &mut TransferReport,
    ) -> Result<(), EngineError> {
        let empty = PathFilter::default();
        let filter = self.filter.unwrap_or(&empty);

        let entries = match &mut source {
            TreeSource::Directory(root) => enumerate_directory(*root, filter)?,
            TreeSource::Archive(reader) => enumerate_archive(&mut **reader)?,
        };

        if let TreeDestination::Directory(root) = &destination {
            fs::create_dir_all(root.path()).map_err(|e| EngineError::DirectoryCreationFailed {
                path: root.path().to_path_buf(),
                source: e,
            })?;
        }

        debug!(entries = entries.len(), "tree enumerated");
        let mut engine = CopyEngine::new(self.pool, self.options.clone(), self.progress);
        let mut skipped_subtrees: Vec<String> = Vec::new();

        for entry in entries {
            if self.options.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            // Children of a skipped or failed directory are not visited
            if skipped_subtrees
                .iter()
                .any(|prefix| entry.relative_path.starts_with(prefix.as_str()))
            {
                continue;
            }
            let rel = entry.relative_path.as_str();

            if filter.is_filtered(rel) {
                debug!(path = rel, "filtered");
                let item = report.record_skipped(rel, entry.is_dir);
                self.notify(item);
                if entry.is_dir {
                    skipped_subtrees.push(format!("{}/", rel));
                }
                continue;
            }

            if let Some(err) = &entry.failure {
                warn!(path = rel, error = %err, "entry skipped");
                let item = report.record_failure(rel, entry.is_dir, err);
                self.notify(item);
                if entry.is_dir {
                    skipped_subtrees.push(format!("{}/", rel));
                }
                continue;
            }

            if let Some(progress) = self.progress {
                progress.set_status(rel);
            }

            if entry.is_dir {
                match self.create_directory(rel, &mut destination) {
                    Ok(committed) => {
                        if committed {
                            report.commits += 1;
                        }
                        let item = report.record_done(rel, true, 0);
                        self.notify(item);
                    }
                    Err(e) if e.is_fatal() => {
                        report.record_failure(rel, true, &e);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(path = rel, error = %e, "directory not created, skipping subtree");
                        let item = report.record_failure(rel, true, &e);
                        self.notify(item);
                        skipped_subtrees.push(format!("{}/", rel));
                    }
                }
                continue;
            }

            let source_path;
            let copy_source = match &mut source {
                TreeSource::Directory(root) => {
                    source_path = root.join(rel);
                    CopySource::Path(&source_path)
                }
                TreeSource::Archive(reader) => CopySource::ArchiveEntry {
                    archive: &mut **reader,
                    index: entry.index.unwrap_or_default(),
                },
            };
            let destination_path;
            let copy_destination = match &mut destination {
                TreeDestination::Directory(root) => {
                    destination_path = root.path().join(rel);
                    CopyDestination::Path {
                        path: &destination_path,
                        journal: root.journal(),
                    }
                }
                TreeDestination::Archive(writer) => CopyDestination::ArchiveEntry {
                    archive: &mut **writer,
                    name: rel,
                },
            };

            match engine.transfer(copy_source, copy_destination) {
                Ok(outcome) => {
                    report.commits += outcome.commits;
                    let item = report.record_done(rel, false, outcome.bytes_written);
                    self.notify(item);
                }
                Err(e) if e.is_fatal() => {
                    report.record_failure(rel, false, &e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(path = rel, error = %e, "file not copied");
                    let item = report.record_failure(rel, false, &e);
                    self.notify(item);
                }
            }
        }

        Ok(())
    }

    /// Create one destination directory.
    ///
    /// # Returns
    /// True if the device was committed afterwards
    fn create_directory(&self, rel: &str, destination: &mut TreeDestination<'_>) -> Result<bool, EngineError> {
        match destination {
            TreeDestination::Directory(root) => {
                let path = root.path().join(rel);
                fs::create_dir_all(&path)
                    .map_err(|e| EngineError::DirectoryCreationFailed { path, source: e })?;
                root.commit()
            }
            TreeDestination::Archive(writer) => {
                if self.store_directories {
                    writer.add_directory(rel)?;
                }
                Ok(false)
            }
        }
    }
}
