//! # SaveVault Engine - Save Data Backup Library
//!
//! A streaming copy and backup engine for console save data.
//! Designed as the foundation for any front end (CLI, menu UI, automation).
//!
//! ## Overview
//!
//! The engine moves save files between a mounted save filesystem and two
//! backup shapes: a plain directory tree and a single `.zip` archive.
//! It features:
//! - Overlapped reads and writes through a single-slot byte channel
//! - Journal-aware commits for transactional save devices
//! - Per-file error isolation with a full transfer report
//! - A binary sidecar describing the save container for restores
//! - Progress reporting through a trait, decoupled from any UI
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use savevault::{
//!     BackupEngine, ContainerSizing, DirectoryRoot, EngineConfig, HostDevice, Journal,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BackupEngine::new(EngineConfig::default())?;
//!
//! // Back up a save into an archive
//! let report = engine.create_backup(
//!     Path::new("/mnt/save"),
//!     Path::new("/backups/Player - 2024-03-05_07-08-09.zip"),
//!     None,
//!     None,
//! )?;
//! println!("{} files backed up", report.files.len());
//!
//! // Restore it onto a journaled device
//! let device = Arc::new(HostDevice::new("save", "/mnt/save"));
//! let root = DirectoryRoot::journaled("/mnt/save", Journal::new(0x200000, device)?);
//! let outcome = engine.restore_backup(
//!     Path::new("/backups/Player - 2024-03-05_07-08-09.zip"),
//!     &root,
//!     ContainerSizing::default(),
//!     None,
//! )?;
//! println!("{} commits", outcome.report.commits);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **channel**: Producer/consumer byte handoff and cancellation
//! - **journal**: Commit threshold policy for journaled destinations
//! - **device**: Save device boundary (commit, capacity)
//! - **archive**: Zip reader/writer adapter and entry naming
//! - **reader**: Reusable producer worker pool
//! - **copy**: Single-file copy state machine
//! - **walker**: Tree enumeration and per-file dispatch
//! - **backup**: Create, overwrite, restore and delete backups
//! - **meta**: Save metadata sidecar
//! - **filter**: Excluded path lists
//! - **digest**: BLAKE3 tree digests for verification
//! - **model**: Transfer reports and item states
//! - **progress**: Progress sink trait
//! - **config**: Engine configuration
//! - **error**: Error types and handling

pub mod archive;
pub mod backup;
pub mod channel;
pub mod config;
pub mod copy;
pub mod device;
pub mod digest;
pub mod error;
pub mod filter;
pub mod journal;
pub mod meta;
pub mod model;
pub mod progress;
pub mod reader;
pub mod walker;

// Re-export main types and functions
pub use archive::{ArchiveReader, ArchiveWriter, EntryInfo};
pub use backup::{
    backup_has_contents, backup_name, delete_backup, directory_info, is_archive_path,
    read_backup_meta, BackupEngine, DirectoryInfo, RestoreOutcome,
};
pub use channel::{ByteChannel, CancelToken};
pub use config::EngineConfig;
pub use copy::{CopyDestination, CopyEngine, CopyOptions, CopyOutcome, CopySource, CopyStage};
pub use device::{HostDevice, SaveDevice};
pub use digest::{diff, tree_digest, TreeDigest};
pub use error::EngineError;
pub use filter::PathFilter;
pub use journal::{Journal, JournalController, MIN_JOURNAL_LIMIT, SAFETY_MARGIN};
pub use meta::{ContainerSizing, SaveInfo, SaveMetaRecord, SAVE_META_NAME};
pub use model::{FileItem, FileState, JobState, OperationKind, TransferReport};
pub use progress::{ProgressSink, TaskProgress};
pub use reader::ReaderPool;
pub use walker::{DirectoryRoot, TreeDestination, TreeSource, TreeWalker};
