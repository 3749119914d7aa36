// src/throttle.rs

use crate::callbacks::DownloadBatchStatusCallback;
use crate::status::DownloadBatchStatus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::debug;

/// Limits how often batch statuses reach consumers.
///
/// Without a registered callback every update is dropped.
pub trait CallbackThrottle: Send + Sync {
    fn set_callback(&self, callback: DownloadBatchStatusCallback);
    fn update(&self, status: DownloadBatchStatus);
    /// Flushes what is still pending and cancels scheduled work.
    fn stop_updates(&self);
}

/// Which throttle a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ThrottleConfig {
    #[default]
    ByProgress,
    ByTime { period_ms: u64 },
}

pub type ThrottleFactory = Arc<dyn Fn() -> Arc<dyn CallbackThrottle> + Send + Sync>;

/// Builds one throttle per batch.
#[derive(Clone)]
pub enum CallbackThrottleCreator {
    Config(ThrottleConfig),
    Custom(ThrottleFactory),
}

impl CallbackThrottleCreator {
    pub fn create(&self) -> Arc<dyn CallbackThrottle> {
        match self {
            CallbackThrottleCreator::Config(ThrottleConfig::ByProgress) => {
                Arc::new(ThrottleByProgress::new())
            }
            CallbackThrottleCreator::Config(ThrottleConfig::ByTime { period_ms }) => {
                Arc::new(ThrottleByTime::new(Duration::from_millis(*period_ms)))
            }
            CallbackThrottleCreator::Custom(factory) => factory(),
        }
    }
}

impl From<ThrottleConfig> for CallbackThrottleCreator {
    fn from(config: ThrottleConfig) -> Self {
        CallbackThrottleCreator::Config(config)
    }
}

#[derive(Default)]
struct ProgressState {
    callback: Option<DownloadBatchStatusCallback>,
    last_emitted: Option<DownloadBatchStatus>,
    pending: Option<DownloadBatchStatus>,
}

/// Forwards a status only when its percentage, error type or coarse status
/// differs from the last one emitted.
#[derive(Default)]
pub struct ThrottleByProgress {
    state: Mutex<ProgressState>,
}

impl ThrottleByProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

fn differs_in_progress(previous: &DownloadBatchStatus, next: &DownloadBatchStatus) -> bool {
    previous.percentage_downloaded != next.percentage_downloaded
        || previous.status != next.status
        || previous.error_type() != next.error_type()
}

impl CallbackThrottle for ThrottleByProgress {
    fn set_callback(&self, callback: DownloadBatchStatusCallback) {
        self.state.lock().callback = Some(callback);
    }

    fn update(&self, status: DownloadBatchStatus) {
        let emit = {
            let mut state = self.state.lock();
            let Some(callback) = state.callback.clone() else {
                debug!(batch_id = %status.batch_id, "no callback registered, dropping status");
                return;
            };
            let changed = state
                .last_emitted
                .as_ref()
                .map_or(true, |last| differs_in_progress(last, &status));
            if changed {
                state.last_emitted = Some(status.clone());
                state.pending = None;
                Some((callback, status))
            } else {
                state.pending = Some(status);
                None
            }
        };

        if let Some((callback, status)) = emit {
            callback(&status);
        }
    }

    fn stop_updates(&self) {
        let emit = {
            let mut state = self.state.lock();
            match (state.callback.clone(), state.pending.take()) {
                (Some(callback), Some(pending)) if state.last_emitted.as_ref() != Some(&pending) => {
                    state.last_emitted = Some(pending.clone());
                    Some((callback, pending))
                }
                _ => None,
            }
        };

        if let Some((callback, status)) = emit {
            callback(&status);
        }
    }
}

#[derive(Default)]
struct TimeState {
    callback: Option<DownloadBatchStatusCallback>,
    latest: Option<DownloadBatchStatus>,
    dirty: bool,
    ticker: Option<JoinHandle<()>>,
}

/// Emits the most recent status at a fixed rate.
///
/// Updates arriving while a tick is scheduled only replace the pending
/// payload; a single timer task is kept per throttle.
pub struct ThrottleByTime {
    period: Duration,
    state: Arc<Mutex<TimeState>>,
}

impl ThrottleByTime {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            state: Arc::new(Mutex::new(TimeState::default())),
        }
    }

    fn spawn_ticker(&self) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let state = Arc::clone(&self.state);
        let period = self.period;
        Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let emit = {
                    let mut state = state.lock();
                    if !state.dirty {
                        continue;
                    }
                    state.dirty = false;
                    state.callback.clone().zip(state.latest.clone())
                };
                if let Some((callback, status)) = emit {
                    callback(&status);
                }
            }
        }))
    }
}

impl CallbackThrottle for ThrottleByTime {
    fn set_callback(&self, callback: DownloadBatchStatusCallback) {
        self.state.lock().callback = Some(callback);
    }

    fn update(&self, status: DownloadBatchStatus) {
        let needs_ticker = {
            let mut state = self.state.lock();
            if state.callback.is_none() {
                debug!(batch_id = %status.batch_id, "no callback registered, dropping status");
                return;
            }
            state.latest = Some(status);
            state.dirty = true;
            state.ticker.is_none()
        };

        if needs_ticker {
            if let Some(ticker) = self.spawn_ticker() {
                let mut state = self.state.lock();
                if state.ticker.is_none() {
                    state.ticker = Some(ticker);
                } else {
                    // Another update won the race to schedule.
                    ticker.abort();
                }
            }
        }
    }

    fn stop_updates(&self) {
        let emit = {
            let mut state = self.state.lock();
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
            state.dirty = false;
            state.callback.clone().zip(state.latest.clone())
        };

        if let Some((callback, status)) = emit {
            callback(&status);
        }
    }
}

impl Drop for ThrottleByTime {
    fn drop(&mut self) {
        if let Some(ticker) = self.state.lock().ticker.take() {
            ticker.abort();
        }
    }
}
