// src/download_batch.rs

use crate::batch::Batch;
use crate::connection::ConnectionChecker;
use crate::download_file::{DownloadFile, FileOperations};
use crate::executor::DownloadExecutor;
use crate::models::{
    DownloadBatchId, DownloadErrorType, DownloadFailure, DownloadFileId, FilePath,
    FilePersistenceType,
};
use crate::persistence::{
    DownloadsBatchPersisted, DownloadsFilePersisted, DownloadsPersistence, PersistenceError,
};
use crate::rules::DownloadBatchRequirementRules;
use crate::status::{
    derive_batch_status, DownloadBatchStatus, DownloadFileStatus, FileStatus,
    InternalDownloadBatchStatus, Status,
};
use crate::throttle::CallbackThrottle;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Collaborators shared by every batch of a manager.
#[derive(Clone)]
pub struct BatchServices {
    pub persistence: Arc<dyn DownloadsPersistence>,
    pub rules: DownloadBatchRequirementRules,
    pub connection: Arc<ConnectionChecker>,
    pub executor: DownloadExecutor,
    pub file_operations: FileOperations,
}

/// Rows describing a freshly requested batch, ready to be persisted.
pub fn persisted_rows(
    batch: &Batch,
    persistence_type: FilePersistenceType,
) -> (DownloadsBatchPersisted, Vec<DownloadsFilePersisted>) {
    let batch_id = batch.batch_id().clone();
    let files = batch
        .files()
        .iter()
        .map(|file| {
            let file_path =
                FilePath::resolve(batch.storage_root(), &batch_id, &file.relative_path());
            let file_name = file_path
                .file_name()
                .map(|name| name.as_str().to_string())
                .unwrap_or_default();
            DownloadsFilePersisted {
                batch_id: batch_id.clone(),
                file_id: file.resolved_file_id(&batch_id),
                file_name,
                file_path,
                url: file.network_address.clone(),
                total_size: file.file_size,
                persistence_type,
            }
        })
        .collect();

    let row = DownloadsBatchPersisted {
        batch_id,
        title: batch.title().clone(),
        status: Status::Queued,
        storage_root: batch.storage_root().to_path_buf(),
        downloaded_date_time_ms: None,
        notification_seen: false,
    };
    (row, files)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A tracked group of files downloaded together.
///
/// Status transitions happen under `status`; every transition except
/// `mark_for_deletion` is written through to persistence.
pub struct DownloadBatch {
    batch_id: DownloadBatchId,
    files: Vec<Arc<DownloadFile>>,
    status: Mutex<InternalDownloadBatchStatus>,
    throttle: Arc<dyn CallbackThrottle>,
    services: BatchServices,
    cancel: Mutex<CancellationToken>,
    run_lock: tokio::sync::Mutex<()>,
}

impl DownloadBatch {
    /// Rebuilds a batch from its persisted rows, re-reading stored byte counts.
    ///
    /// A batch persisted as `Downloading` was interrupted by a restart and
    /// comes back `Queued`.
    pub async fn from_persisted(
        row: DownloadsBatchPersisted,
        file_rows: Vec<DownloadsFilePersisted>,
        throttle: Arc<dyn CallbackThrottle>,
        services: BatchServices,
    ) -> Arc<Self> {
        let mut files = Vec::with_capacity(file_rows.len());
        for file_row in file_rows {
            let current = services
                .file_operations
                .current_size(file_row.persistence_type, &file_row.file_path)
                .await;
            files.push(Arc::new(DownloadFile::from_persisted(
                file_row,
                current,
                services.file_operations.clone(),
            )));
        }

        let restored = match row.status {
            Status::Downloading | Status::Deletion => Status::Queued,
            other => other,
        };
        let mut status =
            InternalDownloadBatchStatus::new(row.batch_id.clone(), row.title, row.storage_root, restored);
        status.set_downloaded_date_time_ms(row.downloaded_date_time_ms);
        status.set_notification_seen(row.notification_seen);

        let batch = Arc::new(Self {
            batch_id: row.batch_id,
            files,
            status: Mutex::new(status),
            throttle,
            services,
            cancel: Mutex::new(CancellationToken::new()),
            run_lock: tokio::sync::Mutex::new(()),
        });
        batch.refresh_bytes();

        if restored != row.status {
            debug!(batch_id = %batch.batch_id, from = ?row.status, "restored interrupted batch as queued");
            batch.persist_status().await;
        }
        batch
    }

    pub fn batch_id(&self) -> &DownloadBatchId {
        &self.batch_id
    }

    pub fn status(&self) -> Status {
        self.status.lock().status()
    }

    pub fn snapshot(&self) -> DownloadBatchStatus {
        self.status.lock().snapshot()
    }

    pub fn file_status(&self, file_id: &DownloadFileId) -> Option<DownloadFileStatus> {
        self.files
            .iter()
            .find(|file| file.file_id() == file_id)
            .map(|file| file.status())
    }

    pub fn file_statuses(&self) -> Vec<DownloadFileStatus> {
        self.files.iter().map(|file| file.status()).collect()
    }

    /// Runs every file that is not yet downloaded, respecting the executor's
    /// bound, the requirement rules and the connection policy.
    pub async fn download(self: &Arc<Self>) {
        let _run = self.run_lock.lock().await;

        let current = self.status();
        if matches!(
            current,
            Status::Paused | Status::Deletion | Status::Deleted | Status::Downloaded
        ) {
            debug!(batch_id = %self.batch_id, status = ?current, "batch not runnable");
            return;
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        if !self.services.connection.is_allowed_to_download() {
            info!(batch_id = %self.batch_id, "connection not allowed, waiting for network");
            if let Err(err) = self.wait_for_network().await {
                error!(batch_id = %self.batch_id, error = %err, "could not persist waiting state");
            }
            return;
        }

        {
            let mut status = self.status.lock();
            if status.status() == Status::WaitingForNetwork {
                status.mark_as_queued();
            }
        }
        for file in &self.files {
            file.mark_queued();
        }
        for file in &self.files {
            if token.is_cancelled() {
                break;
            }
            if file.probe_size().await.is_some() {
                if let Err(err) = self.services.persistence.persist_file(&file.to_persisted()).await {
                    error!(batch_id = %self.batch_id, file_id = %file.file_id(), error = %err, "could not persist file size");
                }
            }
        }
        self.refresh_bytes();

        if let Some(rule) = self.services.rules.get_violated_rule(&self.snapshot()) {
            let code = rule.code();
            warn!(batch_id = %self.batch_id, code, "requirement rule violated");
            let snapshot = {
                let mut status = self.status.lock();
                if status.status().is_explicit() {
                    return;
                }
                status.mark_as_error(DownloadFailure::new(
                    DownloadErrorType::RequirementRuleViolated { code },
                    format!("requirement rule {code} violated"),
                ));
                status.snapshot()
            };
            self.persist_status().await;
            self.throttle.update(snapshot);
            self.throttle.stop_updates();
            return;
        }

        let snapshot = {
            let mut status = self.status.lock();
            if status.status().is_explicit() {
                return;
            }
            status.mark_as_downloading();
            status.snapshot()
        };
        info!(batch_id = %self.batch_id, files = self.files.len(), "batch downloading");
        self.persist_status().await;
        self.throttle.update(snapshot);

        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let mut transfers = JoinSet::new();
        for file in self.files.iter().filter(|file| !file.is_downloaded()) {
            let batch = Arc::clone(self);
            let file = Arc::clone(file);
            let token = token.clone();
            let status_tx = status_tx.clone();
            transfers.spawn(async move {
                let Some(_permit) = batch.services.executor.acquire(&token).await else {
                    return;
                };
                if token.is_cancelled() || batch.has_failed() {
                    debug!(batch_id = %batch.batch_id, file_id = %file.file_id(), "skipping transfer");
                    return;
                }
                let on_status = move |status: DownloadFileStatus| {
                    let _ = status_tx.send(status);
                };
                file.download(&token, &on_status).await;
            });
        }
        drop(status_tx);

        loop {
            tokio::select! {
                Some(file_status) = status_rx.recv() => self.on_file_status(&file_status).await,
                joined = transfers.join_next() => match joined {
                    Some(Err(err)) => {
                        error!(batch_id = %self.batch_id, error = %err, "file transfer task failed")
                    }
                    Some(Ok(())) => {}
                    None => break,
                },
            }
        }
        while let Some(file_status) = status_rx.recv().await {
            self.on_file_status(&file_status).await;
        }

        self.finish_run().await;
    }

    /// True once the batch or any of its files has failed.
    fn has_failed(&self) -> bool {
        self.status() == Status::Error
            || self
                .files
                .iter()
                .any(|file| file.status().status == FileStatus::Error)
    }

    /// Folds a reported file status into the batch. Derived transitions are
    /// written through to persistence.
    async fn on_file_status(&self, file_status: &DownloadFileStatus) {
        trace!(
            batch_id = %self.batch_id,
            file_id = %file_status.file_id,
            status = ?file_status.status,
            bytes = file_status.file_size.current,
            "file status"
        );
        let (snapshot, transitioned) = {
            let mut status = self.status.lock();
            let (bytes, total) = self.byte_totals();
            status.update_bytes(bytes, total);
            let before = status.status();
            if !before.is_explicit() {
                let statuses: Vec<_> = self
                    .file_statuses()
                    .into_iter()
                    .map(|live| {
                        if live.file_id == file_status.file_id {
                            file_status.clone()
                        } else {
                            live
                        }
                    })
                    .collect();
                let (derived, failure) =
                    derive_batch_status(statuses.iter().map(|s| (s.status, s.error.as_ref())));
                match (derived, failure) {
                    (Status::Error, Some(failure)) if before != Status::Error => {
                        status.mark_as_error(failure)
                    }
                    (Status::Downloaded, _) if before != Status::Downloaded => {
                        status.mark_as_downloaded(now_ms())
                    }
                    (Status::Downloading, _) if before == Status::Queued => {
                        status.mark_as_downloading()
                    }
                    _ => {}
                }
            }
            (status.snapshot(), status.status() != before)
        };
        if transitioned {
            info!(batch_id = %self.batch_id, status = ?snapshot.status, "batch status changed");
            self.persist_status().await;
        }
        self.throttle.update(snapshot);
    }

    async fn finish_run(&self) {
        let (snapshot, transitioned) = {
            let mut status = self.status.lock();
            let transitioned = status.status() == Status::Downloading;
            if transitioned {
                let statuses = self.file_statuses();
                match derive_batch_status(statuses.iter().map(|s| (s.status, s.error.as_ref()))) {
                    (Status::Downloaded, _) => status.mark_as_downloaded(now_ms()),
                    (Status::Error, Some(failure)) => status.mark_as_error(failure),
                    _ => status.mark_as_queued(),
                }
            }
            (status.snapshot(), transitioned)
        };

        match snapshot.status {
            Status::Downloaded => {
                info!(batch_id = %self.batch_id, bytes = snapshot.bytes_downloaded, "batch downloaded")
            }
            Status::Error => {
                warn!(batch_id = %self.batch_id, error = ?snapshot.download_error, "batch failed")
            }
            _ => {}
        }
        if transitioned {
            self.persist_status().await;
        }
        self.throttle.update(snapshot);
        self.throttle.stop_updates();
    }

    /// Stops in-flight transfers at their next chunk boundary, keeping their bytes.
    pub async fn pause(&self) -> Result<(), PersistenceError> {
        let snapshot = {
            let mut status = self.status.lock();
            if matches!(
                status.status(),
                Status::Deletion | Status::Deleted | Status::Downloaded
            ) {
                debug!(batch_id = %self.batch_id, status = ?status.status(), "pause ignored");
                return Ok(());
            }
            status.mark_as_paused();
            status.snapshot()
        };
        self.cancel.lock().cancel();
        for file in &self.files {
            file.pause();
        }
        info!(batch_id = %self.batch_id, "batch paused");
        self.write_status(&snapshot).await?;
        self.throttle.update(snapshot);
        Ok(())
    }

    /// Like `pause`, but a later connection change may resume the batch on its own.
    pub async fn wait_for_network(&self) -> Result<(), PersistenceError> {
        let snapshot = {
            let mut status = self.status.lock();
            if !matches!(status.status(), Status::Queued | Status::Downloading) {
                return Ok(());
            }
            status.mark_as_waiting_for_network();
            status.snapshot()
        };
        self.cancel.lock().cancel();
        for file in &self.files {
            file.wait_for_network();
        }
        info!(batch_id = %self.batch_id, "batch waiting for network");
        self.write_status(&snapshot).await?;
        self.throttle.update(snapshot);
        Ok(())
    }

    /// Queues the batch again. Returns `false` when there is nothing to resume.
    pub async fn resume(&self) -> Result<bool, PersistenceError> {
        let snapshot = {
            let mut status = self.status.lock();
            if matches!(
                status.status(),
                Status::Downloading | Status::Downloaded | Status::Deletion | Status::Deleted
            ) {
                debug!(batch_id = %self.batch_id, status = ?status.status(), "resume ignored");
                return Ok(false);
            }
            status.mark_as_queued();
            status.snapshot()
        };
        for file in &self.files {
            file.mark_queued();
        }
        info!(batch_id = %self.batch_id, "batch resumed");
        self.write_status(&snapshot).await?;
        self.throttle.update(snapshot);
        Ok(true)
    }

    /// Stops transfers, removes stored bytes and persisted rows. `Deleted` is terminal.
    pub async fn delete(&self) -> Result<(), PersistenceError> {
        self.status.lock().mark_for_deletion();
        self.cancel.lock().cancel();
        let _run = self.run_lock.lock().await;

        for file in &self.files {
            file.delete().await;
        }
        self.services.persistence.delete(&self.batch_id).await?;

        self.status.lock().mark_as_deleted();
        self.refresh_bytes();
        let snapshot = self.snapshot();
        info!(batch_id = %self.batch_id, "batch deleted");
        self.throttle.update(snapshot);
        self.throttle.stop_updates();
        Ok(())
    }

    pub async fn update_notification_seen(&self, seen: bool) -> Result<(), PersistenceError> {
        self.status.lock().set_notification_seen(seen);
        self.services
            .persistence
            .update_notification_seen(&self.batch_id, seen)
            .await
    }

    fn byte_totals(&self) -> (u64, Option<u64>) {
        let mut bytes = 0;
        let mut total = Some(0u64);
        for file in &self.files {
            let size = file.file_size();
            bytes += size.current;
            total = total.zip(size.total).map(|(sum, file_total)| sum + file_total);
        }
        (bytes, total)
    }

    fn refresh_bytes(&self) {
        let (bytes, total) = self.byte_totals();
        self.status.lock().update_bytes(bytes, total);
    }

    async fn write_status(&self, snapshot: &DownloadBatchStatus) -> Result<(), PersistenceError> {
        self.services
            .persistence
            .update_status(&self.batch_id, snapshot.status, snapshot.downloaded_date_time_ms)
            .await
    }

    /// Background write of the current status; failures are logged.
    async fn persist_status(&self) {
        let snapshot = self.snapshot();
        if let Err(err) = self.write_status(&snapshot).await {
            error!(batch_id = %self.batch_id, status = ?snapshot.status, error = %err, "could not persist batch status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ActiveConnection, ConnectionType, NetworkConnectivity};
    use crate::downloader::{FileDownloader, FileSizeRequester};
    use crate::file_persistence::FilePersistenceCreator;
    use crate::http::{HttpClient, NetworkResponse};
    use crate::models::DownloadBatchTitle;
    use crate::persistence::SqliteDownloadsPersistence;
    use crate::rules::DownloadBatchRequirementRule;
    use crate::test_support::{FixedCapacity, ScriptedHttp};
    use crate::throttle::ThrottleByProgress;
    use bytes::Bytes;
    use std::path::Path;
    use tempfile::tempdir;

    struct Offline;

    impl NetworkConnectivity for Offline {
        fn current(&self) -> Option<ActiveConnection> {
            None
        }
    }

    struct AlwaysViolated;

    impl DownloadBatchRequirementRule for AlwaysViolated {
        fn has_violated_rule(&self, _status: &DownloadBatchStatus) -> bool {
            true
        }

        fn code(&self) -> i32 {
            7
        }
    }

    async fn services(
        http: Arc<ScriptedHttp>,
        connectivity: Arc<dyn NetworkConnectivity>,
        rules: DownloadBatchRequirementRules,
    ) -> BatchServices {
        let http: Arc<dyn HttpClient> = http;
        BatchServices {
            persistence: Arc::new(SqliteDownloadsPersistence::open_in_memory().await.unwrap()),
            rules,
            connection: Arc::new(ConnectionChecker::new(connectivity, ConnectionType::All)),
            executor: DownloadExecutor::new(1),
            file_operations: FileOperations {
                downloader: FileDownloader::new(http.clone()),
                size_requester: FileSizeRequester::new(http),
                persistence: FilePersistenceCreator::new(Arc::new(FixedCapacity(u64::MAX)), None),
            },
        }
    }

    async fn batch_with(root: &Path, services: BatchServices, sizes: &[(&str, u64)]) -> Arc<DownloadBatch> {
        let mut builder = Batch::builder(root, DownloadBatchId::new("batch"), "Maps");
        for (name, size) in sizes {
            builder = builder
                .download_from(format!("http://host/{name}"))
                .with_size(*size)
                .apply();
        }
        let (row, files) = persisted_rows(&builder.build().unwrap(), FilePersistenceType::Internal);
        services.persistence.persist_batch(&row, &files).await.unwrap();
        let throttle = Arc::new(ThrottleByProgress::new());
        DownloadBatch::from_persisted(row, files, throttle, services).await
    }

    #[test]
    fn rows_resolve_paths_under_batch_directory() {
        let batch = Batch::builder("/data", DownloadBatchId::new("b1"), "Maps")
            .download_from("http://host/files/a.zip")
            .apply()
            .build()
            .unwrap();

        let (row, files) = persisted_rows(&batch, FilePersistenceType::Internal);

        assert_eq!(row.title, DownloadBatchTitle::new("Maps"));
        assert_eq!(row.status, Status::Queued);
        assert_eq!(files[0].file_name, "a.zip");
        assert_eq!(files[0].file_path.as_path(), Path::new("/data/b1/a.zip"));
    }

    #[tokio::test]
    async fn downloads_all_files_and_persists_completion() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![
            Ok(NetworkResponse::from_chunks(200, vec![Bytes::from_static(b"aaa")])),
            Ok(NetworkResponse::from_chunks(200, vec![Bytes::from_static(b"bbb")])),
        ]);
        let services = services(http, Arc::new(crate::connection::AlwaysConnected), Default::default()).await;
        let persistence = services.persistence.clone();
        let batch = batch_with(dir.path(), services, &[("a.zip", 3), ("b.zip", 3)]).await;

        batch.download().await;

        let snapshot = batch.snapshot();
        assert_eq!(snapshot.status, Status::Downloaded);
        assert_eq!(snapshot.bytes_downloaded, 6);
        assert_eq!(snapshot.percentage_downloaded, 100);
        assert!(snapshot.downloaded_date_time_ms.is_some());
        let row = persistence.load_batch(batch.batch_id()).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Downloaded);
        assert_eq!(row.downloaded_date_time_ms, snapshot.downloaded_date_time_ms);
    }

    #[tokio::test]
    async fn first_error_stops_remaining_transfers() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![Ok(NetworkResponse::empty(503))]);
        let services = services(http.clone(), Arc::new(crate::connection::AlwaysConnected), Default::default()).await;
        let batch = batch_with(dir.path(), services, &[("a.zip", 4), ("b.zip", 2)]).await;

        batch.download().await;

        let snapshot = batch.snapshot();
        assert_eq!(snapshot.status, Status::Error);
        assert_eq!(
            snapshot.error_type(),
            Some(DownloadErrorType::NetworkErrorCannotDownloadFile)
        );
        assert_eq!(http.request_count(), 1);
    }

    #[tokio::test]
    async fn progress_on_a_queued_batch_persists_downloading() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let services = services(http, Arc::new(crate::connection::AlwaysConnected), Default::default()).await;
        let persistence = services.persistence.clone();
        let batch = batch_with(dir.path(), services, &[("a.zip", 4), ("b.zip", 4)]).await;
        assert_eq!(batch.status(), Status::Queued);

        let mut reported = batch.file_statuses().remove(0);
        reported.status = FileStatus::Downloading;
        batch.on_file_status(&reported).await;

        assert_eq!(batch.status(), Status::Downloading);
        let row = persistence.load_batch(batch.batch_id()).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Downloading);
    }

    #[tokio::test]
    async fn violated_rule_blocks_transfers() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let rules = DownloadBatchRequirementRules::new(vec![Arc::new(AlwaysViolated)]);
        let services = services(http.clone(), Arc::new(crate::connection::AlwaysConnected), rules).await;
        let batch = batch_with(dir.path(), services, &[("a.zip", 4)]).await;

        batch.download().await;

        assert_eq!(
            batch.snapshot().error_type(),
            Some(DownloadErrorType::RequirementRuleViolated { code: 7 })
        );
        assert_eq!(http.request_count(), 0);
    }

    #[tokio::test]
    async fn disallowed_connection_waits_for_network() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let services = services(http.clone(), Arc::new(Offline), Default::default()).await;
        let persistence = services.persistence.clone();
        let batch = batch_with(dir.path(), services, &[("a.zip", 4)]).await;

        batch.download().await;

        assert_eq!(batch.status(), Status::WaitingForNetwork);
        assert_eq!(http.request_count(), 0);
        let row = persistence.load_batch(batch.batch_id()).await.unwrap().unwrap();
        assert_eq!(row.status, Status::WaitingForNetwork);
    }

    #[tokio::test]
    async fn paused_batch_does_not_run_until_resumed() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![Ok(NetworkResponse::from_chunks(
            200,
            vec![Bytes::from_static(b"aaaa")],
        ))]);
        let services = services(http.clone(), Arc::new(crate::connection::AlwaysConnected), Default::default()).await;
        let batch = batch_with(dir.path(), services, &[("a.zip", 4)]).await;

        batch.pause().await.unwrap();
        batch.download().await;
        assert_eq!(batch.status(), Status::Paused);
        assert_eq!(http.request_count(), 0);

        assert!(batch.resume().await.unwrap());
        assert_eq!(batch.status(), Status::Queued);
        batch.download().await;
        assert_eq!(batch.status(), Status::Downloaded);
        assert!(!batch.resume().await.unwrap());
    }

    #[tokio::test]
    async fn restart_normalises_downloading_and_reads_stored_bytes() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let services = services(http, Arc::new(crate::connection::AlwaysConnected), Default::default()).await;
        let batch = Batch::builder(dir.path(), DownloadBatchId::new("batch"), "Maps")
            .download_from("http://host/a.zip")
            .with_size(10)
            .apply()
            .build()
            .unwrap();
        let (mut row, files) = persisted_rows(&batch, FilePersistenceType::Internal);
        row.status = Status::Downloading;
        services.persistence.persist_batch(&row, &files).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("batch")).await.unwrap();
        tokio::fs::write(dir.path().join("batch/a.zip"), b"abcd").await.unwrap();

        let persistence = services.persistence.clone();
        let restored =
            DownloadBatch::from_persisted(row, files, Arc::new(ThrottleByProgress::new()), services).await;

        let snapshot = restored.snapshot();
        assert_eq!(snapshot.status, Status::Queued);
        assert_eq!(snapshot.bytes_downloaded, 4);
        assert_eq!(snapshot.percentage_downloaded, 40);
        let row = persistence.load_batch(restored.batch_id()).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Queued);
    }

    #[tokio::test]
    async fn delete_removes_files_and_rows() {
        let dir = tempdir().unwrap();
        let http = ScriptedHttp::replying(vec![]);
        let services = services(http, Arc::new(crate::connection::AlwaysConnected), Default::default()).await;
        let persistence = services.persistence.clone();
        let batch = batch_with(dir.path(), services, &[("a.zip", 4)]).await;
        tokio::fs::create_dir_all(dir.path().join("batch")).await.unwrap();
        tokio::fs::write(dir.path().join("batch/a.zip"), b"ab").await.unwrap();

        batch.delete().await.unwrap();

        assert_eq!(batch.status(), Status::Deleted);
        assert!(!dir.path().join("batch/a.zip").exists());
        assert!(persistence.load_batch(batch.batch_id()).await.unwrap().is_none());
        assert!(persistence.load_files(batch.batch_id()).await.unwrap().is_empty());
    }
}
