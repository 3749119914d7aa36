// src/manager.rs

use crate::batch::Batch;
use crate::callbacks::{
    CallbackId, CallbackRegistry, DownloadBatchStatusCallback, DownloadSessionSink, SessionSlot,
    StatusDispatcher,
};
use crate::config::{ConfigError, DownloadManagerConfig};
use crate::connection::{AlwaysConnected, ConnectionChecker, ConnectionType, NetworkConnectivity};
use crate::download_batch::{persisted_rows, BatchServices, DownloadBatch};
use crate::download_file::FileOperations;
use crate::downloader::{FileDownloader, FileSizeRequester};
use crate::executor::DownloadExecutor;
use crate::file_persistence::{FilePersistenceCreator, FileSystemCapacity, StorageCapacity};
use crate::http::{HttpClient, HttpError, ReqwestHttpClient};
use crate::models::{DownloadBatchId, DownloadFileId};
use crate::persistence::{
    DownloadsBatchPersisted, DownloadsFilePersisted, DownloadsPersistence, PersistenceError,
};
use crate::rules::{DownloadBatchRequirementRule, DownloadBatchRequirementRules, StorageRequirementRule};
use crate::status::{DownloadBatchStatus, DownloadFileStatus, Status};
use crate::throttle::{CallbackThrottleCreator, ThrottleFactory};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("download service was not initialised within {0:?}")]
    ServiceNotInitialised(Duration),
    #[error("http client error: {0}")]
    Http(#[from] HttpError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// The central component that owns every active batch and routes control
/// operations to them.
///
/// Control operations on unknown batch ids are silent no-ops.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    batches: Mutex<HashMap<DownloadBatchId, Arc<DownloadBatch>>>,
    callbacks: Arc<CallbackRegistry>,
    session: watch::Sender<SessionSlot>,
    services: BatchServices,
    throttles: CallbackThrottleCreator,
    config: DownloadManagerConfig,
}

impl DownloadManager {
    pub fn builder(persistence: Arc<dyn DownloadsPersistence>) -> DownloadManagerBuilder {
        DownloadManagerBuilder::new(persistence)
    }

    pub fn config(&self) -> &DownloadManagerConfig {
        &self.inner.config
    }

    /// Attaches the host's session sink; queries waiting on it are released.
    pub fn initialise(&self, sink: Arc<dyn DownloadSessionSink>) {
        self.inner.session.send_replace(Some(sink));
        info!("download service attached");
    }

    /// Materialises `batch` (or its stored copy) and schedules it. A batch that
    /// is already active is left alone.
    pub async fn download(&self, batch: &Batch) -> Result<(), ManagerError> {
        let batch_id = batch.batch_id();
        let mut batches = self.inner.batches.lock().await;
        if batches.contains_key(batch_id) {
            debug!(%batch_id, "batch already active, ignoring download");
            return Ok(());
        }

        let persistence = &self.inner.services.persistence;
        let download_batch = match persistence.load_batch(batch_id).await? {
            Some(row) => {
                let files = persistence.load_files(batch_id).await?;
                self.restore(row, files).await
            }
            None => {
                let (row, files) =
                    persisted_rows(batch, self.inner.config.default_persistence_type);
                persistence.persist_batch(&row, &files).await?;
                info!(%batch_id, files = files.len(), "new batch persisted");
                self.restore(row, files).await
            }
        };
        batches.insert(batch_id.clone(), Arc::clone(&download_batch));
        drop(batches);

        self.inner.services.executor.submit(download_batch);
        Ok(())
    }

    pub async fn pause(&self, batch_id: &DownloadBatchId) -> Result<(), ManagerError> {
        let Some(batch) = self.active(batch_id).await else {
            debug!(%batch_id, "pause for unknown batch ignored");
            return Ok(());
        };
        batch.pause().await?;
        Ok(())
    }

    pub async fn resume(&self, batch_id: &DownloadBatchId) -> Result<(), ManagerError> {
        let batch = {
            let mut batches = self.inner.batches.lock().await;
            let Some(batch) = batches.get(batch_id).cloned() else {
                debug!(%batch_id, "resume for unknown batch ignored");
                return Ok(());
            };
            if batch.status() == Status::Downloading {
                debug!(%batch_id, "batch already downloading, resume ignored");
                return Ok(());
            }
            batches.remove(batch_id);
            batches.insert(batch_id.clone(), Arc::clone(&batch));
            batch
        };

        if batch.resume().await? {
            self.inner.services.executor.submit(batch);
        }
        Ok(())
    }

    /// The batch stays tracked, and can be deleted again, if removing its
    /// rows fails.
    pub async fn delete(&self, batch_id: &DownloadBatchId) -> Result<(), ManagerError> {
        let Some(batch) = self.active(batch_id).await else {
            debug!(%batch_id, "delete for unknown batch ignored");
            return Ok(());
        };
        batch.delete().await?;

        let mut batches = self.inner.batches.lock().await;
        if batches
            .get(batch_id)
            .is_some_and(|tracked| Arc::ptr_eq(tracked, &batch))
        {
            batches.remove(batch_id);
        }
        Ok(())
    }

    /// Loads every stored batch that is not active yet and schedules it, in
    /// persisted order. `on_done` runs once all of them are dispatched.
    pub async fn submit_all_stored_downloads<F>(&self, on_done: F) -> Result<(), ManagerError>
    where
        F: FnOnce() + Send,
    {
        let restored = self.load_stored().await?;
        info!(submitted = restored.len(), "stored downloads submitted");
        for batch in restored {
            self.inner.services.executor.submit(batch);
        }
        on_done();
        Ok(())
    }

    /// Makes stored batches active without scheduling them, so they can be
    /// queried or deleted. Returns how many were loaded.
    pub async fn restore_stored_downloads(&self) -> Result<usize, ManagerError> {
        Ok(self.load_stored().await?.len())
    }

    async fn load_stored(&self) -> Result<Vec<Arc<DownloadBatch>>, ManagerError> {
        let persistence = &self.inner.services.persistence;
        let rows = persistence.load_batches().await?;
        let mut restored = Vec::new();

        for row in rows {
            let mut batches = self.inner.batches.lock().await;
            if batches.contains_key(&row.batch_id) {
                continue;
            }
            let batch_id = row.batch_id.clone();
            let files = persistence.load_files(&batch_id).await?;
            let batch = self.restore(row, files).await;
            batches.insert(batch_id, Arc::clone(&batch));
            restored.push(batch);
        }
        Ok(restored)
    }

    /// Snapshot of every active batch, ordered by batch id. Waits (bounded)
    /// for `initialise`.
    pub async fn get_all_download_batch_statuses(
        &self,
    ) -> Result<Vec<DownloadBatchStatus>, ManagerError> {
        self.wait_for_service().await?;
        let batches: Vec<_> = self.inner.batches.lock().await.values().cloned().collect();
        let mut statuses: Vec<_> = batches.iter().map(|batch| batch.snapshot()).collect();
        statuses.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        Ok(statuses)
    }

    /// Callback form of [`get_all_download_batch_statuses`](Self::get_all_download_batch_statuses).
    pub fn get_all_download_batch_statuses_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Vec<DownloadBatchStatus>) + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.get_all_download_batch_statuses().await {
                Ok(statuses) => callback(statuses),
                Err(err) => error!(error = %err, "could not collect batch statuses"),
            }
        });
    }

    pub async fn get_download_status_with_matching(
        &self,
        batch_id: &DownloadBatchId,
    ) -> Option<DownloadBatchStatus> {
        self.active(batch_id).await.map(|batch| batch.snapshot())
    }

    pub async fn get_download_file_status_with_matching(
        &self,
        batch_id: &DownloadBatchId,
        file_id: &DownloadFileId,
    ) -> Option<DownloadFileStatus> {
        self.active(batch_id).await?.file_status(file_id)
    }

    pub async fn update_notification_seen(
        &self,
        batch_id: &DownloadBatchId,
        seen: bool,
    ) -> Result<(), ManagerError> {
        if let Some(batch) = self.active(batch_id).await {
            batch.update_notification_seen(seen).await?;
        }
        Ok(())
    }

    /// Changes the connection policy. Downloading batches wait for network when
    /// it is no longer allowed; waiting batches resume once it is.
    pub async fn update_allowed_connection_type(
        &self,
        allowed: ConnectionType,
    ) -> Result<(), ManagerError> {
        let connection = &self.inner.services.connection;
        connection.update_allowed_connection_type(allowed);
        let batches: Vec<_> = self.inner.batches.lock().await.values().cloned().collect();

        if connection.is_allowed_to_download() {
            for batch in batches {
                if batch.status() == Status::WaitingForNetwork && batch.resume().await? {
                    self.inner.services.executor.submit(batch);
                }
            }
        } else {
            for batch in batches {
                if batch.status() == Status::Downloading {
                    batch.wait_for_network().await?;
                }
            }
        }
        info!(?allowed, "allowed connection type updated");
        Ok(())
    }

    pub fn add_download_batch_callback(&self, callback: DownloadBatchStatusCallback) -> CallbackId {
        self.inner.callbacks.add(callback)
    }

    pub fn remove_download_batch_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.remove(id)
    }

    async fn active(&self, batch_id: &DownloadBatchId) -> Option<Arc<DownloadBatch>> {
        self.inner.batches.lock().await.get(batch_id).cloned()
    }

    async fn restore(
        &self,
        row: DownloadsBatchPersisted,
        files: Vec<DownloadsFilePersisted>,
    ) -> Arc<DownloadBatch> {
        let throttle = self.inner.throttles.create();
        let dispatcher =
            StatusDispatcher::new(Arc::clone(&self.inner.callbacks), self.inner.session.subscribe());
        throttle.set_callback(dispatcher.as_callback());
        DownloadBatch::from_persisted(row, files, throttle, self.inner.services.clone()).await
    }

    async fn wait_for_service(&self) -> Result<(), ManagerError> {
        let timeout = self.inner.config.service_wait_timeout();
        let mut session = self.inner.session.subscribe();
        let ready = tokio::time::timeout(timeout, session.wait_for(|slot| slot.is_some()))
            .await
            .map(|attached| attached.is_ok())
            .unwrap_or(false);
        if ready {
            Ok(())
        } else {
            Err(ManagerError::ServiceNotInitialised(timeout))
        }
    }
}

/// Assembles a `DownloadManager` from its configuration and collaborators.
pub struct DownloadManagerBuilder {
    persistence: Arc<dyn DownloadsPersistence>,
    config: DownloadManagerConfig,
    http: Option<Arc<dyn HttpClient>>,
    connectivity: Arc<dyn NetworkConnectivity>,
    capacity: Arc<dyn StorageCapacity>,
    rules: Vec<Arc<dyn DownloadBatchRequirementRule>>,
    throttle_factory: Option<ThrottleFactory>,
    external_root: Option<PathBuf>,
}

impl DownloadManagerBuilder {
    fn new(persistence: Arc<dyn DownloadsPersistence>) -> Self {
        Self {
            persistence,
            config: DownloadManagerConfig::default(),
            http: None,
            connectivity: Arc::new(AlwaysConnected),
            capacity: Arc::new(FileSystemCapacity),
            rules: Vec::new(),
            throttle_factory: None,
            external_root: None,
        }
    }

    pub fn with_config(mut self, config: DownloadManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn NetworkConnectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_storage_capacity(mut self, capacity: Arc<dyn StorageCapacity>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Rules are evaluated in the order they are added.
    pub fn with_requirement_rule(mut self, rule: Arc<dyn DownloadBatchRequirementRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Overrides the configured throttle with a custom one, built per batch.
    pub fn with_callback_throttle_factory(mut self, factory: ThrottleFactory) -> Self {
        self.throttle_factory = Some(factory);
        self
    }

    /// Root directory of external storage; without it external files cannot be created.
    pub fn with_external_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.external_root = Some(root.into());
        self
    }

    pub fn build(self) -> Result<DownloadManager, ManagerError> {
        self.config.validate()?;
        let config = self.config;

        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new(
                config.http.timeout(),
                &config.http.user_agent,
            )?),
        };

        let mut rules = DownloadBatchRequirementRules::default();
        if config.reserved_storage_bytes > 0 {
            rules.push(Arc::new(StorageRequirementRule::with_bytes(
                Arc::clone(&self.capacity),
                config.reserved_storage_bytes,
            )));
        }
        for rule in self.rules {
            rules.push(rule);
        }

        let services = BatchServices {
            persistence: self.persistence,
            rules,
            connection: Arc::new(ConnectionChecker::new(
                self.connectivity,
                config.allowed_connection_type,
            )),
            executor: DownloadExecutor::new(config.max_concurrent_downloads),
            file_operations: FileOperations {
                downloader: FileDownloader::new(Arc::clone(&http)),
                size_requester: FileSizeRequester::new(http),
                persistence: FilePersistenceCreator::new(self.capacity, self.external_root),
            },
        };
        let throttles = match self.throttle_factory {
            Some(factory) => CallbackThrottleCreator::Custom(factory),
            None => CallbackThrottleCreator::from(config.callback_throttle),
        };
        let (session, _) = watch::channel(None);

        info!(
            max_concurrent_downloads = config.max_concurrent_downloads,
            allowed_connection_type = ?config.allowed_connection_type,
            "download manager ready"
        );
        Ok(DownloadManager {
            inner: Arc::new(Inner {
                batches: Mutex::new(HashMap::new()),
                callbacks: Arc::new(CallbackRegistry::default()),
                session,
                services,
                throttles,
                config,
            }),
        })
    }
}
