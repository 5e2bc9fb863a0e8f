//! The pooled upstream HTTP client (connection pool: max 100 idle, 100
//! per-host, 90s idle timeout) and the two wall-clock deadlines (60s
//! non-stream, 300s stream).
//!
//! Kept as a thin wrapper over `wreq` rather than re-exposing it directly, so
//! the dispatcher depends on a narrow trait it can fake in tests without
//! pulling in a real socket.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

pub const NON_STREAM_TIMEOUT: Duration = Duration::from_secs(60);
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect error: {0}")]
    Connect(String),
    #[error("timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<Bytes, UpstreamError>> + Send>>,
}

/// Narrow seam the dispatcher calls through; `WreqUpstreamClient` is the
/// production implementation, test doubles implement this directly against
/// an in-memory fixture.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// `wreq`-backed client, one pooled connection manager shared across every
/// request the process handles: providers are passed by value into attempt
/// loops, but the HTTP client itself is a long-lived shared resource.
pub struct WreqUpstreamClient {
    client: wreq::Client,
}

impl WreqUpstreamClient {
    pub fn new() -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

impl Default for WreqUpstreamClient {
    fn default() -> Self {
        Self::new().expect("failed to build default upstream http client")
    }
}

#[async_trait]
impl UpstreamClient for WreqUpstreamClient {
    async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut builder = self.client.request(Method::POST, url).timeout(timeout).body(body);
        for (name, value) in headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        let response = builder.send().await.map_err(classify_wreq_error)?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let byte_stream = response.bytes_stream();
        let mapped = futures_util::StreamExt::map(byte_stream, |chunk| {
            chunk.map_err(|e| UpstreamError::Transport(e.to_string()))
        });

        Ok(UpstreamResponse { status, headers: resp_headers, stream: Box::pin(mapped) })
    }
}

fn classify_wreq_error(err: wreq::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else if err.is_connect() {
        UpstreamError::Connect(err.to_string())
    } else {
        UpstreamError::Transport(err.to_string())
    }
}
