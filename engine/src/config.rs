//! Engine configuration.
//!
//! Loaded from TOML; every field is optional and falls back to its default.
//!
//! ```toml
//! buffer_size = 524288
//! zip_compression_level = 6
//! export_to_zip = true
//! store_directories = true
//! auto_backup_on_restore = true
//! reader_threads = 1
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::EngineError;

pub const MIN_BUFFER_SIZE: usize = 0x1000;
pub const MAX_BUFFER_SIZE: usize = 0x600000;
pub const DEFAULT_BUFFER_SIZE: usize = 0x80000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per producer read and per channel payload
    pub buffer_size: usize,

    /// 0 stores entries, 1-9 deflate
    pub zip_compression_level: u32,

    /// New backups are written as `.zip` archives
    pub export_to_zip: bool,

    /// Empty directories are kept as `name/` entries in archives
    pub store_directories: bool,

    /// Back up the current save before a restore overwrites it
    pub auto_backup_on_restore: bool,

    /// Producer worker threads
    pub reader_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            buffer_size: DEFAULT_BUFFER_SIZE,
            zip_compression_level: 6,
            export_to_zip: true,
            store_directories: true,
            auto_backup_on_restore: true,
            reader_threads: 1,
        }
    }
}

impl EngineConfig {
    /// Load and validate a TOML configuration file.
    ///
    /// # Errors
    /// Returns EngineError::Config on I/O, parse or range errors.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: EngineConfig = toml::from_str(&text)
            .map_err(|e| EngineError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(EngineError::Config(format!(
                "buffer_size {:#x} outside {:#x}..={:#x}",
                self.buffer_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            )));
        }
        if self.zip_compression_level > 9 {
            return Err(EngineError::Config(format!(
                "zip_compression_level {} above 9",
                self.zip_compression_level
            )));
        }
        if self.reader_threads == 0 {
            return Err(EngineError::Config("reader_threads must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_size, 0x80000);
        config.validate().expect("Failed to validate defaults");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("savevault.toml");
        fs::write(&path, "zip_compression_level = 0\nexport_to_zip = false\n")
            .expect("Failed to write config");

        let config = EngineConfig::load(&path).expect("Failed to load config");
        assert_eq!(config.zip_compression_level, 0);
        assert!(!config.export_to_zip);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.auto_backup_on_restore);
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let small = EngineConfig {
            buffer_size: 0x800,
            ..EngineConfig::default()
        };
        assert!(small.validate().is_err());

        let level = EngineConfig {
            zip_compression_level: 12,
            ..EngineConfig::default()
        };
        assert!(level.validate().is_err());

        let threads = EngineConfig {
            reader_threads: 0,
            ..EngineConfig::default()
        };
        assert!(threads.validate().is_err());
    }
}
