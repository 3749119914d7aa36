// src/batch.rs

use crate::models::{DownloadBatchId, DownloadBatchTitle, DownloadFileId};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchBuildError {
    #[error("file id '{0}' is used by more than one file in the batch")]
    DuplicateFileId(DownloadFileId),
    #[error("network address '{0}' is used by more than one file without an explicit file id")]
    DuplicateNetworkAddress(String),
    #[error("path '{0}' must be relative and stay inside the batch directory")]
    InvalidPath(String),
    #[error("local path '{0}' is used by more than one file in the batch")]
    DuplicatePath(String),
    #[error("invalid network address '{0}'")]
    InvalidUrl(String),
    #[error("batch id '{0}' must be a single path component")]
    InvalidBatchId(DownloadBatchId),
}

/// A file as declared by the client, before it is tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub network_address: String,
    /// Relative path (sub directories + file name) under the batch directory.
    pub path: Option<String>,
    pub file_id: Option<DownloadFileId>,
    pub file_size: Option<u64>,
}

impl BatchFile {
    /// The declared id, or a stable id derived from the batch and address.
    pub fn resolved_file_id(&self, batch_id: &DownloadBatchId) -> DownloadFileId {
        match &self.file_id {
            Some(id) => id.clone(),
            None => fallback_file_id(batch_id, &self.network_address),
        }
    }

    /// Path relative to the batch directory: the declared one, or the last
    /// segment of the network address.
    pub fn relative_path(&self) -> String {
        if let Some(path) = &self.path {
            return path.clone();
        }
        Url::parse(&self.network_address)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|segments| segments.last().map(str::to_string))
            })
            .filter(|segment| !segment.is_empty())
            .unwrap_or_else(|| "download".to_string())
    }
}

/// Immutable description of a batch as requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    storage_root: PathBuf,
    batch_id: DownloadBatchId,
    title: DownloadBatchTitle,
    files: Vec<BatchFile>,
}

impl Batch {
    pub fn builder(
        storage_root: impl Into<PathBuf>,
        batch_id: DownloadBatchId,
        title: impl Into<String>,
    ) -> BatchBuilder {
        BatchBuilder {
            storage_root: storage_root.into(),
            batch_id,
            title: DownloadBatchTitle::new(title),
            files: Vec::new(),
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn batch_id(&self) -> &DownloadBatchId {
        &self.batch_id
    }

    pub fn title(&self) -> &DownloadBatchTitle {
        &self.title
    }

    pub fn files(&self) -> &[BatchFile] {
        &self.files
    }
}

pub struct BatchBuilder {
    storage_root: PathBuf,
    batch_id: DownloadBatchId,
    title: DownloadBatchTitle,
    files: Vec<BatchFile>,
}

impl BatchBuilder {
    /// Starts declaring a file; finish it with [`BatchFileBuilder::apply`].
    pub fn download_from(self, network_address: impl Into<String>) -> BatchFileBuilder {
        BatchFileBuilder {
            parent: self,
            file: BatchFile {
                network_address: network_address.into(),
                path: None,
                file_id: None,
                file_size: None,
            },
        }
    }

    pub fn build(self) -> Result<Batch, BatchBuildError> {
        validate_batch_id(&self.batch_id)?;

        let mut seen_ids = HashSet::new();
        let mut seen_addresses = HashSet::new();
        let mut seen_paths = HashSet::new();

        for file in &self.files {
            Url::parse(&file.network_address)
                .map_err(|_| BatchBuildError::InvalidUrl(file.network_address.clone()))?;

            match &file.file_id {
                Some(id) => {
                    if !seen_ids.insert(id.clone()) {
                        return Err(BatchBuildError::DuplicateFileId(id.clone()));
                    }
                }
                None => {
                    if !seen_addresses.insert(file.network_address.clone()) {
                        return Err(BatchBuildError::DuplicateNetworkAddress(
                            file.network_address.clone(),
                        ));
                    }
                }
            }

            let path = file.relative_path();
            let normalised = validate_relative_path(&path)?;
            if !seen_paths.insert(normalised) {
                return Err(BatchBuildError::DuplicatePath(path));
            }
        }

        Ok(Batch {
            storage_root: self.storage_root,
            batch_id: self.batch_id,
            title: self.title,
            files: self.files,
        })
    }
}

pub struct BatchFileBuilder {
    parent: BatchBuilder,
    file: BatchFile,
}

impl BatchFileBuilder {
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file.file_id = Some(DownloadFileId::new(file_id));
        self
    }

    /// Stores the file at `sub_path/file_name` inside the batch directory.
    pub fn save_to(mut self, sub_path: &str, file_name: &str) -> Self {
        let sub_path = sub_path.trim_matches('/');
        self.file.path = Some(if sub_path.is_empty() {
            file_name.to_string()
        } else {
            format!("{sub_path}/{file_name}")
        });
        self
    }

    pub fn with_size(mut self, total_bytes: u64) -> Self {
        self.file.file_size = Some(total_bytes);
        self
    }

    pub fn apply(mut self) -> BatchBuilder {
        self.parent.files.push(self.file);
        self.parent
    }
}

/// The batch id names the batch directory under the storage root.
fn validate_batch_id(batch_id: &DownloadBatchId) -> Result<(), BatchBuildError> {
    let mut components = Path::new(batch_id.as_str()).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !batch_id.as_str().contains(&['/', '\\'][..]) => Ok(()),
        _ => Err(BatchBuildError::InvalidBatchId(batch_id.clone())),
    }
}

/// Returns the path with `.` components dropped, so equivalent spellings compare equal.
fn validate_relative_path(path: &str) -> Result<PathBuf, BatchBuildError> {
    let mut normalised = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalised.push(part),
            Component::CurDir => {}
            _ => return Err(BatchBuildError::InvalidPath(path.to_string())),
        }
    }
    if normalised.as_os_str().is_empty() {
        return Err(BatchBuildError::InvalidPath(path.to_string()));
    }
    Ok(normalised)
}

fn fallback_file_id(batch_id: &DownloadBatchId, network_address: &str) -> DownloadFileId {
    let mut hasher = Sha256::new();
    hasher.update(batch_id.as_str().as_bytes());
    hasher.update(network_address.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    DownloadFileId::new(&digest[..16])
}
