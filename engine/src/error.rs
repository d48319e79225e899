//! Error types for the save copy engine.
//!
//! The primary error type is `EngineError`. Most variants describe a failure
//! on a single file or archive entry; those are recorded in the operation's
//! `TransferReport` and the walk continues with the next sibling. The fatal
//! variants (see [`EngineError::is_fatal`]) abort the whole operation because
//! continuing past them risks corrupting a journaled destination.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the copy, archive, journal and backup layers.
///
/// Note: EngineError wraps io::Error and zip errors and is therefore not
/// serializable. Reports keep the rendered message instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source file or directory does not exist
    #[error("Source not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source or destination could not be opened
    #[error("Failed to open {}: {source}", path.display())]
    OpenError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read from a source file or archive entry
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write to a destination file or archive entry
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Committing the journal of a save device failed
    #[error("Failed to commit data to device '{device}': {source}")]
    CommitError {
        device: String,
        #[source]
        source: io::Error,
    },

    /// The destination could not be reopened or repositioned after a commit
    #[error("Failed to reopen {} after commit: {source}", path.display())]
    ReopenError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The zip codec rejected an operation on an entry or on the archive itself
    #[error("Archive error at '{entry}': {source}")]
    ArchiveError {
        entry: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// An archive entry name would escape the destination root
    #[error("Unsafe archive entry name: '{entry}'")]
    UnsafeEntryName { entry: String },

    /// The save metadata sidecar is malformed (bad magic, revision or size)
    #[error("Invalid save metadata: {reason}")]
    FormatError { reason: String },

    /// Failed to create a directory
    #[error("Failed to create directory {}: {source}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to enumerate a source directory
    #[error("Failed to enumerate directory {}: {source}", path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to delete a backup or wipe a save root
    #[error("Failed to delete {}: {source}", path.display())]
    DeleteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Path is invalid for the requested operation
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Backup holds nothing besides its metadata sidecar
    #[error("Backup is empty: {}", path.display())]
    EmptyBackup { path: PathBuf },

    /// Configuration could not be loaded or is out of range
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was cancelled through its cancel token
    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Returns true if this error must abort the whole operation.
    ///
    /// A failed commit or reopen leaves already confirmed bytes in an
    /// uncommitted journal, and cancellation is an explicit request to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CommitError { .. } | Self::ReopenError { .. } | Self::Cancelled
        )
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::OpenError { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::CommitError { source, .. }
            | Self::ReopenError { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::DeleteFailed { source, .. } => source.raw_os_error().map(|e| e as u32),
            _ => None,
        }
    }

    pub(crate) fn archive(entry: impl Into<String>, source: zip::result::ZipError) -> Self {
        Self::ArchiveError {
            entry: entry.into(),
            source,
        }
    }

    pub(crate) fn format(reason: impl Into<String>) -> Self {
        Self::FormatError {
            reason: reason.into(),
        }
    }
}
