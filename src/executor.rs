// src/executor.rs

use crate::download_batch::DownloadBatch;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shared pool bounding how many file transfers run at once.
///
/// Batch runs are spawned freely; each of their file transfers must hold a
/// permit while it moves bytes.
#[derive(Debug, Clone)]
pub struct DownloadExecutor {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl DownloadExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Starts a run of `batch` in the background.
    pub fn submit(&self, batch: Arc<DownloadBatch>) -> JoinHandle<()> {
        debug!(batch_id = %batch.batch_id(), "batch submitted");
        tokio::spawn(async move { batch.download().await })
    }

    /// Waits for a free slot. `None` when `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bounds_concurrent_holders() {
        let executor = DownloadExecutor::new(1);
        let token = CancellationToken::new();

        let first = executor.acquire(&token).await;
        assert!(first.is_some());

        let blocked = tokio::time::timeout(Duration::from_millis(50), executor.acquire(&token)).await;
        assert!(blocked.is_err());

        drop(first);
        assert!(executor.acquire(&token).await.is_some());
    }

    #[tokio::test]
    async fn cancellation_releases_waiters() {
        let executor = DownloadExecutor::new(1);
        let _held = executor.acquire(&CancellationToken::new()).await;
        let token = CancellationToken::new();
        token.cancel();

        assert!(executor.acquire(&token).await.is_none());
    }

    #[test]
    fn zero_is_clamped_to_one_slot() {
        assert_eq!(DownloadExecutor::new(0).max_concurrent(), 1);
    }
}
