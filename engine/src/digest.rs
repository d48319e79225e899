//! BLAKE3 digests of whole trees.
//!
//! Used to verify that a backup holds the same bytes as the save it was
//! taken from, whichever storage shape either side uses. Directories map to
//! [`DIRECTORY_MARKER`] so empty directories take part in the comparison.
//! The metadata sidecar is never included.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;

use crate::error::EngineError;
use crate::filter::PathFilter;
use crate::walker::{enumerate_archive, enumerate_directory, TreeSource};

pub const DIRECTORY_MARKER: &str = "<dir>";

/// Relative path to lowercase hex BLAKE3 digest, ordered by path.
pub type TreeDigest = BTreeMap<String, String>;

/// Hash every file of `source`.
///
/// # Errors
/// Returns the first read or enumeration error; a digest with holes would
/// not be comparable.
pub fn tree_digest(source: TreeSource<'_>) -> Result<TreeDigest, EngineError> {
    let mut digest = TreeDigest::new();

    match source {
        TreeSource::Directory(root) => {
            for entry in enumerate_directory(root, &PathFilter::default())? {
                if let Some(err) = entry.failure {
                    return Err(err);
                }
                if entry.is_dir {
                    digest.insert(entry.relative_path, DIRECTORY_MARKER.to_string());
                    continue;
                }

                let path = root.join(&entry.relative_path);
                let mut hasher = blake3::Hasher::new();
                let mut file = File::open(&path).map_err(|e| EngineError::ReadError {
                    path: path.clone(),
                    source: e,
                })?;
                io::copy(&mut file, &mut hasher).map_err(|e| EngineError::ReadError { path, source: e })?;
                digest.insert(entry.relative_path, hasher.finalize().to_hex().to_string());
            }
        }
        TreeSource::Archive(reader) => {
            for entry in enumerate_archive(reader)? {
                if let Some(err) = entry.failure {
                    return Err(err);
                }
                match entry.index {
                    Some(index) if !entry.is_dir => {
                        let mut hasher = blake3::Hasher::new();
                        reader.copy_entry_to(index, &mut hasher)?;
                        digest.insert(entry.relative_path, hasher.finalize().to_hex().to_string());
                    }
                    _ => {
                        digest.insert(entry.relative_path, DIRECTORY_MARKER.to_string());
                    }
                }
            }
        }
    }

    Ok(digest)
}

/// Paths whose digests differ or that exist on one side only.
pub fn diff(left: &TreeDigest, right: &TreeDigest) -> Vec<String> {
    let mut differences: Vec<String> = left
        .iter()
        .filter(|(path, hash)| right.get(*path) != Some(*hash))
        .map(|(path, _)| path.clone())
        .collect();
    differences.extend(right.keys().filter(|path| !left.contains_key(*path)).cloned());
    differences.sort();
    differences
}
