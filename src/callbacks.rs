// src/callbacks.rs

use crate::status::DownloadBatchStatus;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub type DownloadBatchStatusCallback = Arc<dyn Fn(&DownloadBatchStatus) + Send + Sync>;

/// Handle returned when a callback is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Host-side consumer of status updates (foreground service, notifications...).
pub trait DownloadSessionSink: Send + Sync {
    fn on_batch_status(&self, status: &DownloadBatchStatus);
}

pub(crate) type SessionSlot = Option<Arc<dyn DownloadSessionSink>>;

/// Registered batch-status callbacks.
///
/// Dispatch iterates a snapshot, so callbacks may add or remove callbacks
/// without deadlocking.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(CallbackId, DownloadBatchStatusCallback)>>,
}

impl CallbackRegistry {
    pub fn add(&self, callback: DownloadBatchStatusCallback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, callback));
        id
    }

    pub fn remove(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<DownloadBatchStatusCallback> {
        self.callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

/// Fans a throttled status out to every callback and the session sink.
#[derive(Clone)]
pub(crate) struct StatusDispatcher {
    registry: Arc<CallbackRegistry>,
    session: watch::Receiver<SessionSlot>,
}

impl StatusDispatcher {
    pub(crate) fn new(registry: Arc<CallbackRegistry>, session: watch::Receiver<SessionSlot>) -> Self {
        Self { registry, session }
    }

    pub(crate) fn dispatch(&self, status: &DownloadBatchStatus) {
        for callback in self.registry.snapshot() {
            callback(status);
        }
        let sink = self.session.borrow().clone();
        if let Some(sink) = sink {
            sink.on_batch_status(status);
        }
    }

    pub(crate) fn as_callback(&self) -> DownloadBatchStatusCallback {
        let dispatcher = self.clone();
        Arc::new(move |status: &DownloadBatchStatus| dispatcher.dispatch(status))
    }
}
