// src/file_persistence.rs

use crate::models::{FilePath, FilePersistenceType, FileSize};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FilePersistenceError {
    #[error("insufficient storage space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("storage unavailable at {}", .0.display())]
    StorageUnavailable(PathBuf),
    #[error("file has not been created")]
    NotOpen,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Reports free space of the volume holding a path.
pub trait StorageCapacity: Send + Sync {
    fn usable_space(&self, path: &Path) -> io::Result<u64>;
    fn total_space(&self, path: &Path) -> io::Result<u64>;
}

/// Queries the mounted disks, picking the one whose mount point is the
/// longest prefix of the target path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSystemCapacity;

impl StorageCapacity for FileSystemCapacity {
    fn usable_space(&self, path: &Path) -> io::Result<u64> {
        disk_space(path).map(|space| space.usable)
    }

    fn total_space(&self, path: &Path) -> io::Result<u64> {
        disk_space(path).map(|space| space.total)
    }
}

struct DiskSpace {
    usable: u64,
    total: u64,
}

/// Paths that do not exist yet are measured through their closest existing ancestor.
fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .unwrap_or(path)
}

fn disk_space(path: &Path) -> io::Result<DiskSpace> {
    let target = existing_ancestor(path);
    let target = std::fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    let best = disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .or_else(|| disks.list().first())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no disk found for {}", target.display()),
            )
        })?;
    Ok(DiskSpace {
        usable: best.available_space(),
        total: best.total_space(),
    })
}

/// Local storage sink for one file transfer.
#[async_trait]
pub trait FilePersistence: Send + Sync {
    /// Opens (creating if needed) the file for appending, checking there is
    /// room for the bytes still missing.
    async fn create(&mut self, path: &FilePath, size: FileSize) -> Result<(), FilePersistenceError>;

    async fn write(&mut self, buffer: &[u8]) -> Result<(), FilePersistenceError>;

    /// Bytes currently stored at `path`; zero when nothing is there.
    async fn current_size(&self, path: &FilePath) -> u64;

    /// Discards the stored bytes, keeping the file open for writing from zero.
    async fn truncate(&mut self) -> Result<(), FilePersistenceError>;

    async fn delete(&mut self, path: &FilePath) -> Result<(), FilePersistenceError>;

    async fn close(&mut self) -> Result<(), FilePersistenceError>;
}

/// Writes to the local file system.
///
/// Both backends create missing directories below their root. `External`
/// additionally requires its configured root to exist and be writable, which
/// models removable media being absent.
pub struct LocalFilePersistence {
    kind: FilePersistenceType,
    capacity: Arc<dyn StorageCapacity>,
    file: Option<File>,
    path: Option<PathBuf>,
    external_root: Option<PathBuf>,
}

impl LocalFilePersistence {
    pub fn internal(capacity: Arc<dyn StorageCapacity>) -> Self {
        Self {
            kind: FilePersistenceType::Internal,
            capacity,
            file: None,
            path: None,
            external_root: None,
        }
    }

    pub fn external(capacity: Arc<dyn StorageCapacity>, root: Option<PathBuf>) -> Self {
        Self {
            kind: FilePersistenceType::External,
            capacity,
            file: None,
            path: None,
            external_root: root,
        }
    }

    fn ensure_space(&self, path: &Path, required: u64) -> Result<(), FilePersistenceError> {
        if required == 0 {
            return Ok(());
        }
        let available = self.capacity.usable_space(path)?;
        if available < required {
            return Err(FilePersistenceError::InsufficientSpace {
                required,
                available,
            });
        }
        Ok(())
    }

    async fn check_external_root(&self) -> Result<(), FilePersistenceError> {
        if self.kind != FilePersistenceType::External {
            return Ok(());
        }
        let root = self
            .external_root
            .clone()
            .ok_or_else(|| FilePersistenceError::StorageUnavailable(PathBuf::new()))?;
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Ok(()),
            _ => Err(FilePersistenceError::StorageUnavailable(root)),
        }
    }
}

#[async_trait]
impl FilePersistence for LocalFilePersistence {
    async fn create(&mut self, path: &FilePath, size: FileSize) -> Result<(), FilePersistenceError> {
        let target = path.as_path();
        self.check_external_root().await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = self.current_size(path).await;
        let remaining = size.total.map_or(0, |total| total.saturating_sub(existing));
        self.ensure_space(target, remaining)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(target)
            .await?;
        debug!(path = %path, existing, remaining, "opened file for writing");
        self.file = Some(file);
        self.path = Some(target.to_path_buf());
        Ok(())
    }

    async fn write(&mut self, buffer: &[u8]) -> Result<(), FilePersistenceError> {
        let path = self.path.clone().ok_or(FilePersistenceError::NotOpen)?;
        self.ensure_space(&path, buffer.len() as u64)?;

        let file = self.file.as_mut().ok_or(FilePersistenceError::NotOpen)?;
        if let Err(err) = file.write_all(buffer).await {
            // A failed write is re-classified once: out of space or a plain io error.
            let available = self.capacity.usable_space(&path).unwrap_or(u64::MAX);
            if available < buffer.len() as u64 {
                return Err(FilePersistenceError::InsufficientSpace {
                    required: buffer.len() as u64,
                    available,
                });
            }
            warn!(path = %path.display(), error = %err, "write failed");
            return Err(err.into());
        }
        Ok(())
    }

    async fn current_size(&self, path: &FilePath) -> u64 {
        tokio::fs::metadata(path.as_path())
            .await
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    async fn truncate(&mut self) -> Result<(), FilePersistenceError> {
        let file = self.file.as_mut().ok_or(FilePersistenceError::NotOpen)?;
        file.flush().await?;
        file.set_len(0).await?;
        Ok(())
    }

    async fn delete(&mut self, path: &FilePath) -> Result<(), FilePersistenceError> {
        self.file = None;
        self.path = None;
        match tokio::fs::remove_file(path.as_path()).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn close(&mut self) -> Result<(), FilePersistenceError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_data().await?;
        }
        self.path = None;
        Ok(())
    }
}

/// Produces a fresh `FilePersistence` per transfer for a given backend.
#[derive(Clone)]
pub struct FilePersistenceCreator {
    capacity: Arc<dyn StorageCapacity>,
    external_root: Option<PathBuf>,
}

impl FilePersistenceCreator {
    pub fn new(capacity: Arc<dyn StorageCapacity>, external_root: Option<PathBuf>) -> Self {
        Self {
            capacity,
            external_root,
        }
    }

    pub fn create(&self, kind: FilePersistenceType) -> Box<dyn FilePersistence> {
        match kind {
            FilePersistenceType::Internal => {
                Box::new(LocalFilePersistence::internal(self.capacity.clone()))
            }
            FilePersistenceType::External => Box::new(LocalFilePersistence::external(
                self.capacity.clone(),
                self.external_root.clone(),
            )),
        }
    }
}
