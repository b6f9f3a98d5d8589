use crate::config::DownloadConfig;
use crate::error::{AppError, AppResult};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::future::Future;

/// A fetched response: status, optional advertised length, streamed body.
pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, AppResult<Bytes>>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Capability interface for fetching remote documents. The downloader does
/// not care how bytes arrive; production uses HTTP, tests use fakes.
pub trait FetchTransport: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = AppResult<FetchResponse>> + Send;
}

/// reqwest-backed transport with streaming bodies.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &DownloadConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl FetchTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> AppResult<FetchResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Download(format!("Request failed for {url}: {e}")))?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(|e| AppError::Download(format!("Body read failed: {e}")))
            .boxed();

        Ok(FetchResponse {
            status,
            content_length,
            body,
        })
    }
}
