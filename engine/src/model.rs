//! Core data model for backup operations.
//!
//! This module defines the records an operation leaves behind:
//! - TransferReport: one backup, restore or overwrite run
//! - FileItem: a single file or directory visited by the walk
//! - OperationKind, FileState, JobState: enums describing progress

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::EngineError;

/// Record of a single backup, overwrite or restore operation.
///
/// A TransferReport encompasses:
/// - Source and destination roots
/// - Every file and directory visited, with its final state
/// - Byte totals and timing
#[derive(Debug)]
pub struct TransferReport {
    /// Unique identifier for this operation
    pub id: Uuid,

    /// What kind of operation produced this report
    pub kind: OperationKind,

    /// Root the data was read from (save root, backup directory or archive)
    pub source_path: PathBuf,

    /// Root the data was written to
    pub destination_path: PathBuf,

    /// All files and directories visited, in walk order
    pub files: Vec<FileItem>,

    /// Current state (Pending, Running, Completed)
    pub state: JobState,

    /// Bytes written to the destination so far
    pub total_bytes_written: u64,

    /// Number of journal commits performed
    pub commits: u32,

    /// When the operation started
    pub start_time: Option<SystemTime>,

    /// When the operation completed
    pub end_time: Option<SystemTime>,
}

/// A single file or directory visited during an operation.
#[derive(Debug, Clone)]
pub struct FileItem {
    /// Path relative to the copy root, forward-slash separated
    pub relative_path: String,

    /// True if this item represents a directory
    pub is_dir: bool,

    /// Bytes written for this item (0 for directories)
    pub bytes_written: u64,

    /// Final state of this item
    pub state: FileState,

    /// OS error code if state is Failed
    pub error_code: Option<u32>,

    /// Human-readable error message
    pub error_message: Option<String>,
}

/// The kind of operation a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Save data copied into a new backup
    Backup,
    /// Existing backup replaced with fresh save data
    Overwrite,
    /// Backup copied back into the save root
    Restore,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Backup => write!(f, "Backup"),
            OperationKind::Overwrite => write!(f, "Overwrite"),
            OperationKind::Restore => write!(f, "Restore"),
        }
    }
}

/// The state of an individual item within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Successfully copied or directory created
    Done,
    /// Excluded by a path filter
    Skipped,
    /// Error occurred; item not copied
    Failed,
}

/// The state of an entire operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Created, not yet started
    Pending,
    /// Currently executing
    Running,
    /// All items processed (some may have failed)
    Completed,
    /// Stopped early by a fatal error
    Aborted,
}

impl TransferReport {
    /// Create an empty report in the Pending state.
    pub fn new(kind: OperationKind, source: &Path, destination: &Path) -> Self {
        TransferReport {
            id: Uuid::new_v4(),
            kind,
            source_path: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            files: Vec::new(),
            state: JobState::Pending,
            total_bytes_written: 0,
            commits: 0,
            start_time: None,
            end_time: None,
        }
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.state = JobState::Running;
        self.start_time = Some(SystemTime::now());
    }

    /// Transition to Completed, or Aborted if a fatal error ended the run.
    pub fn finish(&mut self, aborted: bool) {
        self.state = if aborted {
            JobState::Aborted
        } else {
            JobState::Completed
        };
        self.end_time = Some(SystemTime::now());
    }

    /// Append a successfully processed item.
    pub fn record_done(&mut self, relative_path: &str, is_dir: bool, bytes_written: u64) -> &FileItem {
        self.total_bytes_written += bytes_written;
        self.push(FileItem {
            relative_path: relative_path.to_string(),
            is_dir,
            bytes_written,
            state: FileState::Done,
            error_code: None,
            error_message: None,
        })
    }

    /// Append an item excluded by a filter.
    pub fn record_skipped(&mut self, relative_path: &str, is_dir: bool) -> &FileItem {
        self.push(FileItem {
            relative_path: relative_path.to_string(),
            is_dir,
            bytes_written: 0,
            state: FileState::Skipped,
            error_code: None,
            error_message: None,
        })
    }

    /// Append a failed item, keeping the error code and message.
    pub fn record_failure(&mut self, relative_path: &str, is_dir: bool, error: &EngineError) -> &FileItem {
        self.push(FileItem {
            relative_path: relative_path.to_string(),
            is_dir,
            bytes_written: 0,
            state: FileState::Failed,
            error_code: error.raw_os_error(),
            error_message: Some(error.to_string()),
        })
    }

    fn push(&mut self, item: FileItem) -> &FileItem {
        self.files.push(item);
        &self.files[self.files.len() - 1]
    }

    /// Number of items in the given state.
    pub fn count(&self, state: FileState) -> usize {
        self.files.iter().filter(|f| f.state == state).count()
    }

    /// Items that failed.
    pub fn failures(&self) -> impl Iterator<Item = &FileItem> {
        self.files.iter().filter(|f| f.state == FileState::Failed)
    }

    /// True when nothing failed.
    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed && self.count(FileState::Failed) == 0
    }
}
