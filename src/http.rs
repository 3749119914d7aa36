// src/http.rs

//! HTTP transport seam.
//!
//! The engine only needs HEAD and (ranged) GET, so the transport is reduced to
//! a single `execute` call. `ReqwestHttpClient` is the production implementation;
//! tests substitute their own.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

pub const RANGE: &str = "range";
pub const CONTENT_RANGE: &str = "content-range";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("could not build http client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Head,
    Get,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl NetworkRequest {
    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::Head,
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Requests everything from `offset` to the end of the resource.
    pub fn with_range_from(self, offset: u64) -> Self {
        self.with_header(RANGE, format!("bytes={offset}-"))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub type BodyStream = BoxStream<'static, Result<Bytes, HttpError>>;

pub struct NetworkResponse {
    pub code: u16,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl NetworkResponse {
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Total resource size announced by a `Content-Range: bytes a-b/total` header.
    pub fn content_range_total(&self) -> Option<u64> {
        self.header(CONTENT_RANGE).and_then(parse_content_range_total)
    }

    /// A response without a body, mostly for fakes.
    pub fn empty(code: u16) -> Self {
        Self {
            code,
            headers: HeaderMap::new(),
            content_length: None,
            body: futures_util::stream::empty().boxed(),
        }
    }

    /// A response streaming `chunks`, mostly for fakes.
    pub fn from_chunks(code: u16, chunks: Vec<Bytes>) -> Self {
        let length = chunks.iter().map(|chunk| chunk.len() as u64).sum();
        Self {
            code,
            headers: HeaderMap::new(),
            content_length: Some(length),
            body: futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }
}

impl std::fmt::Debug for NetworkResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkResponse")
            .field("code", &self.code)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: NetworkRequest) -> Result<NetworkResponse, HttpError>;
}

/// `HttpClient` backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, HttpError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(HttpError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: NetworkRequest) -> Result<NetworkResponse, HttpError> {
        let mut builder = match request.method {
            Method::Head => self.client.head(&request.url),
            Method::Get => self.client.get(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|source| HttpError::Request {
            url: request.url.clone(),
            source,
        })?;

        let code = response.status().as_u16();
        let headers = response.headers().clone();
        // reqwest reports 0 for HEAD responses, so read the header directly.
        let content_length = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let url = request.url;
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|source| HttpError::Request {
                    url: url.clone(),
                    source,
                })
            })
            .boxed();

        Ok(NetworkResponse {
            code,
            headers,
            content_length,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes 400-999/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn request_headers_are_case_insensitive() {
        let request = NetworkRequest::get("http://example.com").with_range_from(400);
        assert_eq!(request.header("Range"), Some("bytes=400-"));
    }

    #[tokio::test]
    async fn reqwest_client_sends_range_and_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.zip"))
            .and(header("range", "bytes=2-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 2-4/5")
                    .set_body_bytes(b"cde".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = ReqwestHttpClient::new(Duration::from_secs(5), "odm-batch-test").unwrap();
        let mut response = client
            .execute(NetworkRequest::get(format!("{}/a.zip", server.uri())).with_range_from(2))
            .await
            .unwrap();

        assert_eq!(response.code, 206);
        assert!(response.is_successful());
        assert_eq!(response.content_range_total(), Some(5));

        let mut body = Vec::new();
        while let Some(chunk) = response.body.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"cde");
    }
}
