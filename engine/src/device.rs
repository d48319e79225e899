//! Save devices: the commit-capable side of a mounted save filesystem.
//!
//! Mounting and unmounting belong to the caller. The engine only needs to
//! name the device in logs, commit its journal, and ask it to make room
//! before a restore.

use std::io;
use std::path::{Path, PathBuf};

use crate::meta::ContainerSizing;

/// A mounted, transactional storage device.
pub trait SaveDevice: Send + Sync {
    /// Mount name used in logs and errors.
    fn name(&self) -> &str;

    /// Flush buffered writes into durable state and reset journal usage.
    fn commit(&self) -> io::Result<()>;

    /// Grow the underlying container so it can hold `sizing`.
    fn ensure_capacity(&self, _sizing: &ContainerSizing) -> io::Result<()> {
        Ok(())
    }
}

/// A host directory treated as a save device. Commit syncs the directory.
#[derive(Debug, Clone)]
pub struct HostDevice {
    name: String,
    root: PathBuf,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Self {
        HostDevice {
            name: name.into(),
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SaveDevice for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    fn commit(&self) -> io::Result<()> {
        std::fs::File::open(&self.root)?.sync_all()
    }

    #[cfg(not(unix))]
    fn commit(&self) -> io::Result<()> {
        // Directories cannot be opened for sync here; make sure the root is still mounted.
        std::fs::metadata(&self.root).map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_device_commits_existing_root() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let device = HostDevice::new("save", temp_dir.path());
        assert_eq!(device.name(), "save");
        device.commit().expect("Failed to commit host directory");
    }

    #[test]
    fn test_host_device_commit_fails_when_unmounted() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let device = HostDevice::new("save", temp_dir.path().join("gone"));
        assert!(device.commit().is_err());
    }
}
