//! Resumable, batch-oriented download engine.
//!
//! Clients describe a [`batch::Batch`] of files, hand it to a
//! [`manager::DownloadManager`] and follow progress through batch-status
//! callbacks. Progress is persisted so batches survive restarts and resume
//! with ranged requests.

pub mod batch;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod download_batch;
pub mod download_file;
pub mod downloader;
pub mod executor;
pub mod file_persistence;
pub mod http;
pub mod manager;
pub mod models;
pub mod persistence;
pub mod rules;
pub mod status;
pub mod throttle;

#[cfg(test)]
mod test_support;

/// Convenient re-exports of the everyday types.
pub mod prelude {
    pub use crate::batch::{Batch, BatchBuildError};
    pub use crate::callbacks::{CallbackId, DownloadBatchStatusCallback, DownloadSessionSink};
    pub use crate::config::DownloadManagerConfig;
    pub use crate::connection::{ActiveConnection, ConnectionType, NetworkConnectivity};
    pub use crate::manager::{DownloadManager, DownloadManagerBuilder, ManagerError};
    pub use crate::models::{
        DownloadBatchId, DownloadBatchTitle, DownloadErrorType, DownloadFailure, DownloadFileId,
        FilePersistenceType, FileSize,
    };
    pub use crate::persistence::{DownloadsPersistence, SqliteDownloadsPersistence};
    pub use crate::status::{DownloadBatchStatus, DownloadFileStatus, FileStatus, Status};
    pub use crate::throttle::{CallbackThrottle, ThrottleConfig};
}
