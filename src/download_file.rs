// src/download_file.rs

use crate::downloader::{
    DownloadError, FileDownloader, FileSizeRequester, TransferEvent, TransferOutcome,
};
use crate::file_persistence::{FilePersistenceCreator, FilePersistenceError};
use crate::models::{
    DownloadBatchId, DownloadErrorType, DownloadFailure, DownloadFileId, FileName, FilePath,
    FilePersistenceType, FileSize,
};
use crate::persistence::DownloadsFilePersisted;
use crate::status::{DownloadFileStatus, FileStatus};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a file needs to talk to the network and to storage.
#[derive(Clone)]
pub struct FileOperations {
    pub downloader: FileDownloader,
    pub size_requester: FileSizeRequester,
    pub persistence: FilePersistenceCreator,
}

impl FileOperations {
    pub async fn current_size(&self, kind: FilePersistenceType, path: &FilePath) -> u64 {
        self.persistence.create(kind).current_size(path).await
    }
}

#[derive(Debug)]
struct FileState {
    status: FileStatus,
    file_size: FileSize,
    error: Option<DownloadFailure>,
}

/// Lifecycle of one file in a batch:
/// `Queued -> Downloading -> {Downloaded | Error | Paused}`, `Paused -> Queued`,
/// and anything `-> Deleted` when the batch goes away.
pub struct DownloadFile {
    batch_id: DownloadBatchId,
    file_id: DownloadFileId,
    url: String,
    file_name: FileName,
    file_path: FilePath,
    persistence_type: FilePersistenceType,
    ops: FileOperations,
    state: Mutex<FileState>,
}

impl DownloadFile {
    /// Rebuilds a file from its persisted row and the bytes found in storage.
    pub fn from_persisted(row: DownloadsFilePersisted, current_size: u64, ops: FileOperations) -> Self {
        let file_size = FileSize {
            current: current_size,
            total: row.total_size,
        };
        let status = if file_size.is_complete() {
            FileStatus::Downloaded
        } else {
            FileStatus::Queued
        };
        let file_name = FileName::new(row.file_name);
        Self {
            batch_id: row.batch_id,
            file_id: row.file_id,
            url: row.url,
            file_name,
            file_path: row.file_path,
            persistence_type: row.persistence_type,
            ops,
            state: Mutex::new(FileState {
                status,
                file_size,
                error: None,
            }),
        }
    }

    pub fn to_persisted(&self) -> DownloadsFilePersisted {
        DownloadsFilePersisted {
            batch_id: self.batch_id.clone(),
            file_id: self.file_id.clone(),
            file_name: self.file_name.as_str().to_string(),
            file_path: self.file_path.clone(),
            url: self.url.clone(),
            total_size: self.state.lock().file_size.total,
            persistence_type: self.persistence_type,
        }
    }

    pub fn file_id(&self) -> &DownloadFileId {
        &self.file_id
    }

    pub fn file_size(&self) -> FileSize {
        self.state.lock().file_size
    }

    pub fn status(&self) -> DownloadFileStatus {
        let state = self.state.lock();
        DownloadFileStatus {
            batch_id: self.batch_id.clone(),
            file_id: self.file_id.clone(),
            status: state.status,
            file_size: state.file_size,
            error: state.error.clone(),
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.state.lock().status == FileStatus::Downloaded
    }

    pub fn pause(&self) {
        self.interrupt(FileStatus::Paused);
    }

    pub fn wait_for_network(&self) {
        self.interrupt(FileStatus::WaitingForNetwork);
    }

    fn interrupt(&self, status: FileStatus) {
        let mut state = self.state.lock();
        if matches!(state.status, FileStatus::Queued | FileStatus::Downloading) {
            state.status = status;
        }
    }

    /// Puts an interrupted or failed file back in line; finished files are untouched.
    pub fn mark_queued(&self) {
        let mut state = self.state.lock();
        if !matches!(state.status, FileStatus::Downloaded | FileStatus::Deleted) {
            state.status = FileStatus::Queued;
            state.error = None;
        }
    }

    /// Learns the remote size when it is still unknown. Returns the newly
    /// learned total, if any.
    pub async fn probe_size(&self) -> Option<u64> {
        if self.file_size().is_total_known() {
            return None;
        }
        let total = self.ops.size_requester.request_file_size(&self.url).await?;
        self.state.lock().file_size.total = Some(total);
        debug!(batch_id = %self.batch_id, file_id = %self.file_id, total, "learned file size");
        Some(total)
    }

    /// Removes the stored bytes and marks the file deleted.
    pub async fn delete(&self) {
        let mut persistence = self.ops.persistence.create(self.persistence_type);
        if let Err(err) = persistence.delete(&self.file_path).await {
            warn!(file_id = %self.file_id, path = %self.file_path, error = %err, "could not delete file");
        }
        let mut state = self.state.lock();
        state.status = FileStatus::Deleted;
        state.file_size.current = 0;
    }

    /// Runs one transfer attempt, reporting every state change through `on_status`.
    ///
    /// Transfer failures are captured in the file status and never returned.
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        on_status: &(dyn Fn(DownloadFileStatus) + Send + Sync),
    ) {
        if cancel.is_cancelled() {
            return;
        }

        let mut persistence = self.ops.persistence.create(self.persistence_type);
        let current = persistence.current_size(&self.file_path).await;
        let size = {
            let mut state = self.state.lock();
            state.file_size.current = current;
            state.file_size
        };

        if size.is_complete() {
            self.finish(FileStatus::Downloaded, None);
            on_status(self.status());
            return;
        }
        if let Some(total) = size.total.filter(|total| current > *total) {
            warn!(file_id = %self.file_id, current, total, "local file larger than remote, discarding");
            if let Err(err) = persistence.delete(&self.file_path).await {
                warn!(file_id = %self.file_id, error = %err, "could not discard oversized file");
            }
            self.state.lock().file_size.current = 0;
            self.finish(
                FileStatus::Error,
                Some(DownloadFailure::new(
                    DownloadErrorType::FileCurrentAndTotalSizeMismatch,
                    format!("{current} bytes stored but file is {total} bytes"),
                )),
            );
            on_status(self.status());
            return;
        }

        if let Err(err) = persistence.create(&self.file_path, size).await {
            self.finish(FileStatus::Error, Some(storage_failure(&err)));
            on_status(self.status());
            return;
        }

        let runnable = {
            let mut state = self.state.lock();
            let runnable = matches!(state.status, FileStatus::Queued | FileStatus::Downloading);
            if runnable {
                state.status = FileStatus::Downloading;
                state.error = None;
            }
            runnable
        };
        if !runnable {
            if let Err(err) = persistence.close().await {
                warn!(file_id = %self.file_id, error = %err, "could not close file");
            }
            return;
        }
        info!(batch_id = %self.batch_id, file_id = %self.file_id, from = current, "file transfer started");
        on_status(self.status());

        let mut on_event = |event: TransferEvent| {
            {
                let mut state = self.state.lock();
                match event {
                    TransferEvent::Started { offset, total } => {
                        state.file_size.current = offset;
                        if state.file_size.total.is_none() {
                            state.file_size.total = total;
                        }
                    }
                    TransferEvent::Chunk(bytes) => state.file_size.current += bytes,
                }
            }
            on_status(self.status());
        };

        let result = self
            .ops
            .downloader
            .download(&self.url, persistence.as_mut(), current, cancel, &mut on_event)
            .await;

        let closed = persistence.close().await;
        match result {
            Ok(TransferOutcome::Completed) => match closed {
                Ok(()) => self.complete(),
                Err(err) => {
                    warn!(batch_id = %self.batch_id, file_id = %self.file_id, error = %err, "could not close downloaded file");
                    self.finish(FileStatus::Error, Some(storage_failure(&err)));
                }
            },
            Ok(TransferOutcome::Stopped) => {
                if let Err(err) = closed {
                    warn!(file_id = %self.file_id, error = %err, "could not close file");
                }
                let mut state = self.state.lock();
                if state.status == FileStatus::Downloading {
                    state.status = FileStatus::Paused;
                }
                debug!(file_id = %self.file_id, status = ?state.status, "file transfer stopped");
            }
            Err(err) => {
                if let Err(err) = closed {
                    warn!(file_id = %self.file_id, error = %err, "could not close file");
                }
                warn!(batch_id = %self.batch_id, file_id = %self.file_id, error = %err, "file transfer failed");
                self.finish(FileStatus::Error, Some(transfer_failure(&err)));
            }
        }
        on_status(self.status());
    }

    fn complete(&self) {
        let size = {
            let mut state = self.state.lock();
            if state.file_size.total.is_none() {
                state.file_size.total = Some(state.file_size.current);
            }
            state.file_size
        };
        if size.is_complete() {
            info!(batch_id = %self.batch_id, file_id = %self.file_id, bytes = size.current, "file downloaded");
            self.finish(FileStatus::Downloaded, None);
        } else {
            self.finish(
                FileStatus::Error,
                Some(DownloadFailure::new(
                    DownloadErrorType::FileCurrentAndTotalSizeMismatch,
                    format!(
                        "transfer ended with {} of {} bytes",
                        size.current,
                        size.total.unwrap_or_default()
                    ),
                )),
            );
        }
    }

    fn finish(&self, status: FileStatus, error: Option<DownloadFailure>) {
        let mut state = self.state.lock();
        state.status = status;
        state.error = error;
    }
}

fn storage_failure(err: &FilePersistenceError) -> DownloadFailure {
    let error_type = match err {
        FilePersistenceError::InsufficientSpace { .. } => {
            DownloadErrorType::FileCannotBeCreatedLocallyInsufficientFreeSpace
        }
        FilePersistenceError::StorageUnavailable(_) => DownloadErrorType::StorageUnavailable,
        FilePersistenceError::NotOpen | FilePersistenceError::Io(_) => {
            DownloadErrorType::FileCannotBeWritten
        }
    };
    DownloadFailure::new(error_type, err.to_string())
}

fn transfer_failure(err: &DownloadError) -> DownloadFailure {
    match err {
        DownloadError::Http(_) | DownloadError::UnexpectedResponse { .. } => {
            DownloadFailure::new(DownloadErrorType::NetworkErrorCannotDownloadFile, err.to_string())
        }
        DownloadError::Storage(storage) => storage_failure(storage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpClient, NetworkResponse};
    use crate::test_support::{FixedCapacity, ScriptedHttp};
    use bytes::Bytes;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ops(http: Arc<ScriptedHttp>, capacity: u64) -> FileOperations {
        let http: Arc<dyn HttpClient> = http;
        FileOperations {
            downloader: FileDownloader::new(http.clone()),
            size_requester: FileSizeRequester::new(http),
            persistence: FilePersistenceCreator::new(Arc::new(FixedCapacity(capacity)), None),
        }
    }

    fn row(root: &Path, total: Option<u64>) -> DownloadsFilePersisted {
        DownloadsFilePersisted {
            batch_id: DownloadBatchId::new("batch"),
            file_id: DownloadFileId::new("a"),
            file_name: "a.zip".into(),
            file_path: FilePath::new(root.join("batch/a.zip")),
            url: "http://host/a.zip".into(),
            total_size: total,
            persistence_type: FilePersistenceType::Internal,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<DownloadFileStatus>>>, impl Fn(DownloadFileStatus) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |status| sink.lock().push(status))
    }

    #[tokio::test]
    async fn completes_and_reports_progress() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![Ok(NetworkResponse::from_chunks(
            200,
            vec![Bytes::from_static(b"hello")],
        ))]);
        let file = DownloadFile::from_persisted(row(dir.path(), Some(5)), 0, ops(http, u64::MAX));
        let (seen, on_status) = recorder();

        file.download(&CancellationToken::new(), &on_status).await;

        let status = file.status();
        assert_eq!(status.status, FileStatus::Downloaded);
        assert_eq!(status.file_size, FileSize { current: 5, total: Some(5) });
        let statuses: Vec<_> = seen.lock().iter().map(|s| s.status).collect();
        assert_eq!(statuses.first(), Some(&FileStatus::Downloading));
        assert_eq!(statuses.last(), Some(&FileStatus::Downloaded));
        assert_eq!(tokio::fs::read(dir.path().join("batch/a.zip")).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn already_complete_file_makes_no_request() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("batch")).await.unwrap();
        tokio::fs::write(dir.path().join("batch/a.zip"), b"hello").await.unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let file = DownloadFile::from_persisted(row(dir.path(), Some(5)), 0, ops(http.clone(), u64::MAX));
        let (_, on_status) = recorder();

        file.download(&CancellationToken::new(), &on_status).await;

        assert_eq!(file.status().status, FileStatus::Downloaded);
        assert_eq!(http.request_count(), 0);
    }

    #[tokio::test]
    async fn unknown_total_is_taken_from_completed_stream() {
        let dir = tempdir().unwrap();
        let mut response = NetworkResponse::from_chunks(200, vec![Bytes::from_static(b"abc")]);
        response.content_length = None;
        let http = ScriptedHttp::replying(vec![Ok(response)]);
        let file = DownloadFile::from_persisted(row(dir.path(), None), 0, ops(http, u64::MAX));
        let (_, on_status) = recorder();

        file.download(&CancellationToken::new(), &on_status).await;

        assert_eq!(file.status().status, FileStatus::Downloaded);
        assert_eq!(file.file_size().total, Some(3));
    }

    #[tokio::test]
    async fn error_response_marks_network_error() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![Ok(NetworkResponse::empty(500))]);
        let file = DownloadFile::from_persisted(row(dir.path(), Some(5)), 0, ops(http, u64::MAX));
        let (_, on_status) = recorder();

        file.download(&CancellationToken::new(), &on_status).await;

        let status = file.status();
        assert_eq!(status.status, FileStatus::Error);
        let error = status.error.unwrap();
        assert_eq!(error.error_type, DownloadErrorType::NetworkErrorCannotDownloadFile);
        assert!(error.message.contains("response code 500"));
        assert!(error.message.contains("http://host/a.zip"));
    }

    #[tokio::test]
    async fn short_stream_is_a_size_mismatch() {
        let dir = tempdir().unwrap();
        let mut response = NetworkResponse::from_chunks(200, vec![Bytes::from_static(b"abc")]);
        response.content_length = None;
        let http = ScriptedHttp::replying(vec![Ok(response)]);
        let file = DownloadFile::from_persisted(row(dir.path(), Some(5)), 0, ops(http, u64::MAX));
        let (_, on_status) = recorder();

        file.download(&CancellationToken::new(), &on_status).await;

        let status = file.status();
        assert_eq!(status.status, FileStatus::Error);
        assert_eq!(
            status.error.map(|e| e.error_type),
            Some(DownloadErrorType::FileCurrentAndTotalSizeMismatch)
        );
    }

    #[tokio::test]
    async fn oversized_local_file_is_discarded() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("batch")).await.unwrap();
        tokio::fs::write(dir.path().join("batch/a.zip"), b"too many bytes").await.unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let file = DownloadFile::from_persisted(row(dir.path(), Some(5)), 14, ops(http, u64::MAX));
        let (_, on_status) = recorder();

        file.download(&CancellationToken::new(), &on_status).await;

        assert_eq!(file.status().status, FileStatus::Error);
        assert!(!dir.path().join("batch/a.zip").exists());
    }

    #[tokio::test]
    async fn no_room_is_reported_as_insufficient_space() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let file = DownloadFile::from_persisted(row(dir.path(), Some(5000)), 0, ops(http.clone(), 10));
        let (_, on_status) = recorder();

        file.download(&CancellationToken::new(), &on_status).await;

        assert_eq!(
            file.status().error.map(|e| e.error_type),
            Some(DownloadErrorType::FileCannotBeCreatedLocallyInsufficientFreeSpace)
        );
        assert_eq!(http.request_count(), 0);
    }

    #[tokio::test]
    async fn paused_file_stays_paused_after_cancellation() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let file = DownloadFile::from_persisted(row(dir.path(), Some(5)), 0, ops(http.clone(), u64::MAX));
        let cancel = CancellationToken::new();
        file.pause();
        cancel.cancel();
        let (_, on_status) = recorder();

        file.download(&cancel, &on_status).await;

        assert_eq!(file.status().status, FileStatus::Paused);
        assert_eq!(http.request_count(), 0);

        file.mark_queued();
        assert_eq!(file.status().status, FileStatus::Queued);
    }

    #[tokio::test]
    async fn probe_learns_unknown_size_once() {
        let dir = tempdir().unwrap();
        let mut head = NetworkResponse::empty(200);
        head.content_length = Some(42);
        let http = ScriptedHttp::replying(vec![Ok(head)]);
        let file = DownloadFile::from_persisted(row(dir.path(), None), 0, ops(http.clone(), u64::MAX));

        assert_eq!(file.probe_size().await, Some(42));
        assert_eq!(file.probe_size().await, None);
        assert_eq!(file.to_persisted().total_size, Some(42));
        assert_eq!(http.request_count(), 1);
    }

    #[tokio::test]
    async fn delete_removes_bytes() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("batch")).await.unwrap();
        tokio::fs::write(dir.path().join("batch/a.zip"), b"abc").await.unwrap();
        let file = DownloadFile::from_persisted(
            row(dir.path(), Some(5)),
            3,
            ops(ScriptedHttp::replying(vec![]), u64::MAX),
        );

        file.delete().await;

        assert_eq!(file.status().status, FileStatus::Deleted);
        assert!(!dir.path().join("batch/a.zip").exists());
    }
}
