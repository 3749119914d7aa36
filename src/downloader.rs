// src/downloader.rs

//! Resumable transfer of a single remote file into a `FilePersistence`.

use crate::file_persistence::{FilePersistence, FilePersistenceError};
use crate::http::{HttpClient, HttpError, NetworkRequest};
use futures_util::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Largest slice handed to a single `FilePersistence::write`.
pub const BUFFER_SIZE: usize = 8192;

const RANGE_NOT_SATISFIABLE: u16 = 416;
const PARTIAL_CONTENT: u16 = 206;

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("request to {url} failed with response code {code}")]
    UnexpectedResponse { url: String, code: u16 },
    #[error("storage error: {0}")]
    Storage(#[from] FilePersistenceError),
}

/// Determines the total size of a remote file without downloading it.
#[derive(Clone)]
pub struct FileSizeRequester {
    http: Arc<dyn HttpClient>,
}

impl FileSizeRequester {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    /// HEAD first, then a one-byte ranged GET. `None` means the size stays unknown.
    pub async fn request_file_size(&self, url: &str) -> Option<u64> {
        match self.http.execute(NetworkRequest::head(url)).await {
            Ok(response) if response.is_successful() => {
                if let Some(size) = response.content_length.filter(|size| *size > 0) {
                    debug!(url, size, "size from HEAD");
                    return Some(size);
                }
            }
            Ok(response) => debug!(url, code = response.code, "HEAD rejected"),
            Err(err) => debug!(url, error = %err, "HEAD failed"),
        }

        let request = NetworkRequest::get(url).with_header(crate::http::RANGE, "bytes=0-0");
        match self.http.execute(request).await {
            Ok(response) if response.code == PARTIAL_CONTENT => response.content_range_total(),
            Ok(response) if response.is_successful() => response.content_length,
            Ok(response) => {
                warn!(url, code = response.code, "could not determine file size");
                None
            }
            Err(err) => {
                warn!(url, error = %err, "could not determine file size");
                None
            }
        }
    }
}

/// Progress reported while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// The response was accepted. `offset` is where writing starts; it drops
    /// back to zero when the server ignored the range request.
    Started { offset: u64, total: Option<u64> },
    /// Bytes just written to storage.
    Chunk(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The server closed the body after a successful response.
    Completed,
    /// Cancelled at a chunk boundary; bytes written so far are kept.
    Stopped,
}

#[derive(Clone)]
pub struct FileDownloader {
    http: Arc<dyn HttpClient>,
}

impl FileDownloader {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    /// Streams `url` into `persistence`, continuing after `from_byte` bytes
    /// that are already stored.
    pub async fn download(
        &self,
        url: &str,
        persistence: &mut dyn FilePersistence,
        from_byte: u64,
        cancel: &CancellationToken,
        on_event: &mut (dyn FnMut(TransferEvent) + Send),
    ) -> Result<TransferOutcome, DownloadError> {
        let mut request = NetworkRequest::get(url);
        if from_byte > 0 {
            request = request.with_range_from(from_byte);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TransferOutcome::Stopped),
            response = self.http.execute(request) => response?,
        };

        if from_byte > 0 && response.code == RANGE_NOT_SATISFIABLE {
            debug!(url, from_byte, "range not satisfiable, nothing left to fetch");
            return Ok(TransferOutcome::Completed);
        }
        if !response.is_successful() {
            return Err(DownloadError::UnexpectedResponse {
                url: url.to_string(),
                code: response.code,
            });
        }

        let mut offset = from_byte;
        if from_byte > 0 && response.code != PARTIAL_CONTENT {
            warn!(url, from_byte, code = response.code, "server ignored range, restarting from zero");
            persistence.truncate().await?;
            offset = 0;
        }

        let total = response
            .content_range_total()
            .or_else(|| response.content_length.map(|length| offset + length));
        on_event(TransferEvent::Started { offset, total });

        let mut body = response.body;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TransferOutcome::Stopped),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            for piece in chunk.chunks(BUFFER_SIZE) {
                persistence.write(piece).await?;
                trace!(url, bytes = piece.len(), "chunk written");
                on_event(TransferEvent::Chunk(piece.len() as u64));
                if cancel.is_cancelled() {
                    return Ok(TransferOutcome::Stopped);
                }
            }
        }

        Ok(TransferOutcome::Completed)
    }
}
