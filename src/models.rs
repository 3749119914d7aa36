// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Identifies a batch. Unique across all batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadBatchId(String);

impl DownloadBatchId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadBatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DownloadBatchId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Identifies a file within its batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadFileId(String);

impl DownloadFileId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DownloadFileId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Display title of a batch. Not used for identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadBatchTitle(String);

impl DownloadBatchTitle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadBatchTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte-size state of a single file.
///
/// `total` stays `None` until a size probe (or the transfer response) reveals it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileSize {
    pub current: u64,
    pub total: Option<u64>,
}

impl FileSize {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn with_total(total: u64) -> Self {
        Self {
            current: 0,
            total: Some(total),
        }
    }

    pub fn is_total_known(&self) -> bool {
        self.total.is_some()
    }

    /// True once every byte of a known total is on disk.
    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.current == total)
    }

    /// Bytes still missing, or `None` while the total is unknown.
    pub fn remaining(&self) -> Option<u64> {
        self.total.map(|total| total.saturating_sub(self.current))
    }
}

/// Leaf file name of a download, e.g. `a.zip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileName(String);

impl FileName {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved storage location of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePath(PathBuf);

impl FilePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// `<storage_root>/<batch_id>/<relative_path>`
    pub fn resolve(storage_root: &Path, batch_id: &DownloadBatchId, relative_path: &str) -> Self {
        Self(storage_root.join(batch_id.as_str()).join(relative_path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn file_name(&self) -> Option<FileName> {
        self.0
            .file_name()
            .map(|name| FileName::new(name.to_string_lossy().into_owned()))
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Which storage backend holds a file's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePersistenceType {
    /// Sandboxed application storage.
    #[default]
    Internal,
    /// Public/removable storage that may disappear.
    External,
}

impl FilePersistenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilePersistenceType::Internal => "internal",
            FilePersistenceType::External => "external",
        }
    }
}

impl FromStr for FilePersistenceType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "internal" => Ok(FilePersistenceType::Internal),
            "external" => Ok(FilePersistenceType::External),
            other => Err(format!("unknown persistence type '{other}'")),
        }
    }
}

/// Category of a failure surfaced through file and batch statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DownloadErrorType {
    NetworkErrorCannotDownloadFile,
    FileCannotBeWritten,
    FileCannotBeCreatedLocallyInsufficientFreeSpace,
    FileCurrentAndTotalSizeMismatch,
    StorageUnavailable,
    RequirementRuleViolated { code: i32 },
    Unknown,
}

/// A captured failure: its category plus a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFailure {
    pub error_type: DownloadErrorType,
    pub message: String,
}

impl DownloadFailure {
    pub fn new(error_type: DownloadErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_size_completion_needs_known_total() {
        let mut size = FileSize::unknown();
        size.current = 10;
        assert!(!size.is_complete());
        assert_eq!(size.remaining(), None);

        let mut size = FileSize::with_total(10);
        size.current = 4;
        assert_eq!(size.remaining(), Some(6));
        size.current = 10;
        assert!(size.is_complete());
    }

    #[test]
    fn file_path_nests_under_batch_directory() {
        let path = FilePath::resolve(Path::new("/data"), &DownloadBatchId::new("b1"), "maps/a.zip");
        assert_eq!(path.as_path(), Path::new("/data/b1/maps/a.zip"));
        assert_eq!(path.file_name(), Some(FileName::new("a.zip")));
    }

    #[test]
    fn persistence_type_round_trips_through_str() {
        for kind in [FilePersistenceType::Internal, FilePersistenceType::External] {
            assert_eq!(kind.as_str().parse::<FilePersistenceType>(), Ok(kind));
        }
        assert!("sdcard".parse::<FilePersistenceType>().is_err());
    }
}
