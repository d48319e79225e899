//! Save metadata sidecar.
//!
//! Every backup carries a small fixed-layout record describing the save
//! container it came from, so a restore can size the container before
//! writing into it. Backups without a usable record fall back to the
//! title's declared defaults.
//!
//! Layout (little-endian, packed, 34 bytes):
//!
//! | offset | field           | type |
//! |--------|-----------------|------|
//! | 0      | magic           | u32  |
//! | 4      | revision        | u32  |
//! | 8      | application_id  | u64  |
//! | 16     | save_data_size  | i64  |
//! | 24     | journal_size    | i64  |
//! | 32     | save_data_index | u16  |

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::EngineError;

/// Validity sentinel at the start of every record.
pub const SAVE_META_MAGIC: u32 = 0x5653_4B4A;

/// The only revision this build reads and writes.
pub const SAVE_META_REVISION: u32 = 1;

/// File name of the sidecar inside a backup directory or archive.
pub const SAVE_META_NAME: &str = ".nx_save_meta.bin";

/// Serialized size of a record.
pub const SAVE_META_SIZE: usize = 34;

/// Data and journal capacity of a save container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSizing {
    pub save_data_size: i64,
    pub journal_size: i64,
}

/// Identity and sizing of the save a backup was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveInfo {
    pub application_id: u64,
    pub sizing: ContainerSizing,
    pub save_data_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveMetaRecord {
    magic: u32,
    revision: u32,
    pub application_id: u64,
    pub save_data_size: i64,
    pub journal_size: i64,
    pub save_data_index: u16,
}

impl SaveMetaRecord {
    pub fn new(info: &SaveInfo) -> Self {
        SaveMetaRecord {
            magic: SAVE_META_MAGIC,
            revision: SAVE_META_REVISION,
            application_id: info.application_id,
            save_data_size: info.sizing.save_data_size,
            journal_size: info.sizing.journal_size,
            save_data_index: info.save_data_index,
        }
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn sizing(&self) -> ContainerSizing {
        ContainerSizing {
            save_data_size: self.save_data_size,
            journal_size: self.journal_size,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serialize(self).map_err(|e| EngineError::format(e.to_string()))
    }

    /// Parse and validate a record.
    ///
    /// # Errors
    /// FormatError on a wrong length, bad magic, or a zero/unknown revision.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.len() != SAVE_META_SIZE {
            return Err(EngineError::format(format!(
                "expected {} bytes, found {}",
                SAVE_META_SIZE,
                bytes.len()
            )));
        }

        let record: SaveMetaRecord =
            bincode::deserialize(bytes).map_err(|e| EngineError::format(e.to_string()))?;
        if record.magic != SAVE_META_MAGIC {
            return Err(EngineError::format(format!("bad magic {:#010x}", record.magic)));
        }
        if record.revision != SAVE_META_REVISION {
            return Err(EngineError::format(format!("unsupported revision {}", record.revision)));
        }
        if record.save_data_size < 0 || record.journal_size < 0 {
            return Err(EngineError::format("negative container size"));
        }
        Ok(record)
    }

    /// Write the record as `SAVE_META_NAME` inside `dir`.
    pub fn write_to_dir(&self, dir: &Path) -> Result<(), EngineError> {
        let path = dir.join(SAVE_META_NAME);
        fs::write(&path, self.to_bytes()?).map_err(|e| EngineError::WriteError { path, source: e })
    }

    /// Read the record from `dir`, if one is present.
    pub fn read_from_dir(dir: &Path) -> Result<Option<Self>, EngineError> {
        let path = dir.join(SAVE_META_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| EngineError::ReadError { path, source: e })?;
        Self::from_bytes(&bytes).map(Some)
    }
}

/// Pick the container sizing for a restore: the record's when present,
/// the title defaults otherwise.
pub fn resolve_sizing(meta: Option<&SaveMetaRecord>, defaults: ContainerSizing) -> ContainerSizing {
    meta.map(SaveMetaRecord::sizing).unwrap_or(defaults)
}
