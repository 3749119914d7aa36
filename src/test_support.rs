// src/test_support.rs

//! Fakes shared by the unit tests.

use crate::file_persistence::StorageCapacity;
use crate::http::{HttpClient, HttpError, NetworkRequest, NetworkResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Replies with pre-recorded responses in order and records every request.
#[derive(Default)]
pub(crate) struct ScriptedHttp {
    pub(crate) requests: Mutex<Vec<NetworkRequest>>,
    responses: Mutex<VecDeque<Result<NetworkResponse, HttpError>>>,
}

impl ScriptedHttp {
    pub(crate) fn replying(responses: Vec<Result<NetworkResponse, HttpError>>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(responses.into()),
        })
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn execute(&self, request: NetworkRequest) -> Result<NetworkResponse, HttpError> {
        let url = request.url.clone();
        self.requests.lock().push(request);
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Err(HttpError::Transport {
                url,
                message: "no scripted response".into(),
            })
        })
    }
}

pub(crate) struct FixedCapacity(pub(crate) u64);

impl StorageCapacity for FixedCapacity {
    fn usable_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }

    fn total_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}
