//! Zip archive adapter.
//!
//! Wraps the `zip` crate with the operations the copy engine needs: one entry
//! open for writing at a time on the writer side, and sequential enumeration
//! plus lendable entry access on the reader side.
//!
//! Entry names are forward-slash paths relative to the copy root with the
//! device mount prefix removed. Directories are zero-length `name/` entries.

use chrono::{Datelike, Local, Timelike};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::EngineError;
use crate::meta::SAVE_META_NAME;

/// Entries at or above this size are written with zip64 extensions.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Streaming zip writer with at most one open entry.
pub struct ArchiveWriter {
    zip: ZipWriter<File>,
    path: PathBuf,
    compression_level: u32,
    current_entry: Option<String>,
}

impl ArchiveWriter {
    /// Create (or truncate) the archive at `path`.
    ///
    /// # Arguments
    /// * `path` - Archive file to create
    /// * `compression_level` - 0 stores entries, 1-9 deflate
    ///
    /// # Errors
    /// Returns EngineError::OpenError if the file cannot be created
    pub fn create(path: &Path, compression_level: u32) -> Result<Self, EngineError> {
        let file = File::create(path).map_err(|e| EngineError::OpenError {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(archive = %path.display(), level = compression_level, "archive created");
        Ok(ArchiveWriter {
            zip: ZipWriter::new(file),
            path: path.to_path_buf(),
            compression_level: compression_level.min(9),
            current_entry: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the entry currently open for writing.
    pub fn current_entry(&self) -> Option<&str> {
        self.current_entry.as_deref()
    }

    fn options(&self, size_hint: u64) -> SimpleFileOptions {
        let options = SimpleFileOptions::default()
            .last_modified_time(local_timestamp())
            .large_file(size_hint >= ZIP64_THRESHOLD);
        if self.compression_level == 0 {
            options.compression_method(CompressionMethod::Stored)
        } else {
            options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.compression_level)))
        }
    }

    /// Start a new file entry; previous entry data is finalized by the codec.
    ///
    /// `name` is relative to the copy root. Device paths go through
    /// [`entry_name`] first.
    pub fn begin_entry(&mut self, name: &str, size_hint: u64) -> Result<(), EngineError> {
        let name = relative_entry_name(name);
        let options = self.options(size_hint);
        self.current_entry = None;
        self.zip
            .start_file(name.as_str(), options)
            .map_err(|e| EngineError::archive(name.as_str(), e))?;
        self.current_entry = Some(name);
        Ok(())
    }

    /// Add a zero-length `name/` directory entry.
    pub fn add_directory(&mut self, name: &str) -> Result<(), EngineError> {
        let name = relative_entry_name(name);
        let name = name.trim_end_matches('/');
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(local_timestamp());
        self.current_entry = None;
        self.zip
            .add_directory(format!("{}/", name), options)
            .map_err(|e| EngineError::archive(name, e))
    }

    /// Append bytes to the open entry.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.current_entry.is_none() {
            return Err(io::Error::new(io::ErrorKind::Other, "no archive entry is open"));
        }
        self.zip.write_all(bytes)
    }

    /// Drop the open entry and everything written to it.
    ///
    /// The entry does not appear in the finished archive.
    pub fn abort_entry(&mut self) -> Result<(), EngineError> {
        let Some(name) = self.current_entry.take() else {
            return Ok(());
        };
        self.zip
            .abort_file()
            .map_err(|e| EngineError::archive(name.as_str(), e))?;
        debug!(archive = %self.path.display(), entry = %name, "entry discarded");
        Ok(())
    }

    /// Write the central directory and close the file.
    pub fn finish(self) -> Result<(), EngineError> {
        let path = self.path.display().to_string();
        self.zip
            .finish()
            .map(|_| ())
            .map_err(|e| EngineError::archive(path, e))
    }
}

fn local_timestamp() -> zip::DateTime {
    let now = Local::now();
    let year = u16::try_from(now.year()).unwrap_or(1980);
    zip::DateTime::from_date_and_time(
        year,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    )
    .unwrap_or_default()
}

/// Metadata of one archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Sequential zip reader whose archive can be lent to a producer worker.
pub struct ArchiveReader {
    archive: Option<ZipArchive<File>>,
    path: PathBuf,
    cursor: usize,
    len: usize,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Err(EngineError::SourceNotFound {
                path: path.to_path_buf(),
            });
        }
        let file = File::open(path).map_err(|e| EngineError::OpenError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let archive =
            ZipArchive::new(file).map_err(|e| EngineError::archive(path.display().to_string(), e))?;
        let len = archive.len();
        Ok(ArchiveReader {
            archive: Some(archive),
            path: path.to_path_buf(),
            cursor: 0,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rewind enumeration to the first member.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn archive_mut(&mut self) -> Result<&mut ZipArchive<File>, EngineError> {
        let path = self.path.clone();
        self.archive.as_mut().ok_or_else(|| EngineError::InvalidPath {
            path,
            reason: "archive is in use by a transfer".to_string(),
        })
    }

    /// Metadata of member `index`.
    pub fn entry(&mut self, index: usize) -> Result<EntryInfo, EngineError> {
        let archive = self.archive_mut()?;
        let file = archive
            .by_index(index)
            .map_err(|e| EngineError::archive(format!("#{}", index), e))?;
        Ok(EntryInfo {
            index,
            name: file.name().to_string(),
            size: file.size(),
            is_dir: file.is_dir(),
        })
    }

    /// Next member in archive order, or None past the last one.
    pub fn read_next(&mut self) -> Result<Option<EntryInfo>, EngineError> {
        if self.cursor >= self.len {
            return Ok(None);
        }
        let info = self.entry(self.cursor)?;
        self.cursor += 1;
        Ok(Some(info))
    }

    /// Whole contents of the member called `name`, if present.
    pub fn read_named(&mut self, name: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let path = self.path.join(name);
        let archive = self.archive_mut()?;
        let mut file = match archive.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(EngineError::archive(name, e)),
        };
        let mut bytes = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut bytes)
            .map_err(|e| EngineError::ReadError { path, source: e })?;
        Ok(Some(bytes))
    }

    /// Stream the decompressed bytes of member `index` into `out`.
    pub fn copy_entry_to<W: Write>(&mut self, index: usize, out: &mut W) -> Result<u64, EngineError> {
        let base = self.path.clone();
        let archive = self.archive_mut()?;
        let mut file = archive
            .by_index(index)
            .map_err(|e| EngineError::archive(format!("#{}", index), e))?;
        let path = base.join(file.name());
        io::copy(&mut file, out).map_err(|e| EngineError::ReadError { path, source: e })
    }

    /// True if the archive holds anything besides the metadata sidecar.
    pub fn has_contents(&mut self) -> Result<bool, EngineError> {
        let archive = self.archive_mut()?;
        Ok(archive
            .file_names()
            .any(|name| name.trim_end_matches('/') != SAVE_META_NAME))
    }

    /// Hand the archive to a producer job. Must be paired with `restore`.
    pub(crate) fn lend(&mut self) -> Result<ZipArchive<File>, EngineError> {
        let path = self.path.clone();
        self.archive.take().ok_or(EngineError::InvalidPath {
            path,
            reason: "archive is in use by a transfer".to_string(),
        })
    }

    pub(crate) fn restore(&mut self, archive: ZipArchive<File>) {
        self.archive = Some(archive);
    }
}

/// Normalize a save path into an archive entry name.
///
/// Converts backslashes, strips a `device:/` mount prefix and leading
/// slashes. A trailing slash is kept.
pub fn entry_name(path: &str) -> String {
    let path = path.replace('\\', "/");
    let path = match path.find(":/") {
        Some(pos) if !path[..pos].contains('/') => &path[pos + 2..],
        _ => path.as_str(),
    };
    path.trim_start_matches('/').to_string()
}

/// Normalize a name that is already relative to the copy root.
///
/// Only separators and leading slashes change; a first segment ending in
/// `:` is part of the name.
pub fn relative_entry_name(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Validate a member name read from an archive before it touches the
/// filesystem. Returns the cleaned relative name without a trailing slash.
///
/// # Errors
/// Returns EngineError::UnsafeEntryName for absolute names, drive prefixes
/// and `..` components.
pub fn sanitize_entry_name(name: &str) -> Result<String, EngineError> {
    let unsafe_name = || EngineError::UnsafeEntryName {
        entry: name.to_string(),
    };
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(unsafe_name());
    }

    let mut parts = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(unsafe_name()),
            p if !is_plain_component(p) => return Err(unsafe_name()),
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(unsafe_name());
    }
    Ok(parts.join("/"))
}

/// Drive and UNC prefixes only parse as such on the host that has them.
fn is_plain_component(part: &str) -> bool {
    let mut components = Path::new(part).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_name_normalization() {
        assert_eq!(entry_name("save:/data/slot1.bin"), "data/slot1.bin");
        assert_eq!(entry_name("/data/slot1.bin"), "data/slot1.bin");
        assert_eq!(entry_name("data\\slot1.bin"), "data/slot1.bin");
        assert_eq!(entry_name("dir/"), "dir/");
        assert_eq!(entry_name("a/b:/c"), "a/b:/c");
    }

    #[test]
    fn test_relative_names_keep_colon_segments() {
        assert_eq!(relative_entry_name("x:/file.bin"), "x:/file.bin");
        assert_eq!(relative_entry_name("/dir\\a.bin"), "dir/a.bin");
    }

    #[test]
    fn test_sanitize_rejects_escapes() {
        assert_eq!(sanitize_entry_name("dir/./a.bin").expect("Failed to sanitize"), "dir/a.bin");
        assert_eq!(sanitize_entry_name("dir/").expect("Failed to sanitize"), "dir");
        assert!(sanitize_entry_name("../evil").is_err());
        assert!(sanitize_entry_name("dir/../../evil").is_err());
        assert!(sanitize_entry_name("/etc/passwd").is_err());
        assert!(sanitize_entry_name("").is_err());
    }

    #[cfg(windows)]
    #[test]
    fn test_sanitize_rejects_drive_prefix() {
        assert!(sanitize_entry_name("C:/evil").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_colon_directory_round_trips() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("colon.zip");

        let mut writer = ArchiveWriter::create(&path, 6).expect("Failed to create archive");
        writer.begin_entry("x:/file.bin", 2).expect("Failed to begin entry");
        writer.write(b"ok").expect("Failed to write entry");
        writer.finish().expect("Failed to finish archive");

        let mut reader = ArchiveReader::open(&path).expect("Failed to open archive");
        let entry = reader.read_next().expect("Failed to read").expect("Missing entry");
        assert_eq!(entry.name, "x:/file.bin");
        assert_eq!(sanitize_entry_name(&entry.name).expect("Failed to sanitize"), "x:/file.bin");
    }

    #[test]
    fn test_aborted_entry_is_not_written() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("abort.zip");

        let mut writer = ArchiveWriter::create(&path, 6).expect("Failed to create archive");
        writer.begin_entry("kept.bin", 1).expect("Failed to begin entry");
        writer.write(&[1]).expect("Failed to write entry");
        writer.begin_entry("broken.bin", 100).expect("Failed to begin entry");
        writer.write(&[2; 10]).expect("Failed to write entry");
        writer.abort_entry().expect("Failed to abort entry");
        assert_eq!(writer.current_entry(), None);
        writer.abort_entry().expect("Aborting twice should be a no-op");
        writer.finish().expect("Failed to finish archive");

        let mut reader = ArchiveReader::open(&path).expect("Failed to open archive");
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.read_named("broken.bin").expect("Failed to read"), None);
        assert_eq!(reader.read_named("kept.bin").expect("Failed to read"), Some(vec![1]));
    }

    #[test]
    fn test_write_then_enumerate() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("backup.zip");

        let mut writer = ArchiveWriter::create(&path, 6).expect("Failed to create archive");
        writer.add_directory("/dir").expect("Failed to add directory");
        writer.begin_entry("dir/a.bin", 3).expect("Failed to begin entry");
        assert_eq!(writer.current_entry(), Some("dir/a.bin"));
        writer.write(&[1, 2, 3]).expect("Failed to write entry");
        writer.finish().expect("Failed to finish archive");

        let mut reader = ArchiveReader::open(&path).expect("Failed to open archive");
        assert_eq!(reader.len(), 2);
        let dir = reader.read_next().expect("Failed to read").expect("Missing entry");
        assert!(dir.is_dir);
        assert_eq!(dir.name, "dir/");
        let file = reader.read_next().expect("Failed to read").expect("Missing entry");
        assert_eq!(file.name, "dir/a.bin");
        assert_eq!(file.size, 3);
        assert!(reader.read_next().expect("Failed to read").is_none());

        reader.reset();
        assert_eq!(reader.read_next().expect("Failed to read").map(|e| e.index), Some(0));
        assert_eq!(
            reader.read_named("dir/a.bin").expect("Failed to read"),
            Some(vec![1, 2, 3])
        );
        assert_eq!(reader.read_named("missing").expect("Failed to read"), None);
        assert!(reader.has_contents().expect("Failed to inspect"));
    }

    #[test]
    fn test_stored_entries_and_sidecar_only_archive() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("meta_only.zip");

        let mut writer = ArchiveWriter::create(&path, 0).expect("Failed to create archive");
        writer.begin_entry(SAVE_META_NAME, 34).expect("Failed to begin entry");
        writer.write(&[0u8; 34]).expect("Failed to write entry");
        writer.finish().expect("Failed to finish archive");

        let mut reader = ArchiveReader::open(&path).expect("Failed to open archive");
        assert!(!reader.has_contents().expect("Failed to inspect"));
    }

    #[test]
    fn test_write_without_entry_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut writer =
            ArchiveWriter::create(&temp_dir.path().join("x.zip"), 6).expect("Failed to create archive");
        assert!(writer.write(b"orphan").is_err());
    }

    #[test]
    fn test_lent_archive_is_unavailable_until_restored() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("lend.zip");
        let mut writer = ArchiveWriter::create(&path, 6).expect("Failed to create archive");
        writer.begin_entry("a.bin", 1).expect("Failed to begin entry");
        writer.write(&[9]).expect("Failed to write entry");
        writer.finish().expect("Failed to finish archive");

        let mut reader = ArchiveReader::open(&path).expect("Failed to open archive");
        let archive = reader.lend().expect("Failed to lend archive");
        assert!(reader.entry(0).is_err());
        assert!(reader.lend().is_err());
        reader.restore(archive);
        assert_eq!(reader.entry(0).expect("Failed to read entry").name, "a.bin");
    }

    #[test]
    fn test_open_missing_archive() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = ArchiveReader::open(&temp_dir.path().join("none.zip"));
        assert!(matches!(result, Err(EngineError::SourceNotFound { .. })));
    }
}
