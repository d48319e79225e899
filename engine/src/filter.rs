//! Path filters.
//!
//! A per-title list of save paths that backup, restore and wipe leave alone.
//! Stored as JSON:
//!
//! ```json
//! { "filters": ["save:/settings.bin", "/cache"] }
//! ```
//!
//! Entries may carry the device mount prefix or a leading slash; matching is
//! done on the normalized relative path and is exact.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::archive::{entry_name, relative_entry_name};
use crate::error::EngineError;

#[derive(Debug, Deserialize)]
struct FilterFile {
    #[serde(default)]
    filters: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    paths: HashSet<String>,
}

impl PathFilter {
    /// Load a filter list from a JSON file.
    ///
    /// # Errors
    /// Returns EngineError::Config if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let file: FilterFile = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("invalid filter {}: {}", path.display(), e)))?;
        Ok(Self::from_paths(file.filters))
    }

    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = paths
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        PathFilter { paths }
    }

    pub fn has_paths(&self) -> bool {
        !self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// True if `relative_path` (relative to the save root) is excluded.
    pub fn is_filtered(&self, relative_path: &str) -> bool {
        if self.paths.is_empty() {
            return false;
        }
        let relative = relative_entry_name(relative_path);
        self.paths.contains(relative.trim_end_matches('/'))
    }
}

fn normalize(path: &str) -> String {
    entry_name(path).trim_end_matches('/').to_string()
}
