//! HTTP Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpDownload, HttpMethod, HttpRequest},
};
use futures_util::TryStreamExt;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Reqwest-based HTTP client implementation
///
/// Provides streaming downloads with connection pooling and rustls TLS.
/// Requests are sent exactly once; retry policy lives in the download queue.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a new HTTP client with a custom connect timeout
    ///
    /// No overall request timeout is set: large media bodies can legitimately
    /// take minutes to stream.
    pub fn with_connect_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(10)
            .user_agent(concat!("offline-media-queue/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                BridgeError::OperationFailed(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }

    /// Create a new HTTP client with custom configuration
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Convert bridge HttpMethod to reqwest Method
    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }

    /// Build reqwest request from bridge request
    fn build_request(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let method = Self::convert_method(request.method);
        let mut req = self.client.request(method, &request.url);

        for (key, value) in request.headers {
            req = req.header(key, value);
        }

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        req
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn download_stream(&self, request: HttpRequest) -> Result<HttpDownload> {
        debug!(url = %request.url, "Starting streaming download");

        let response = self.build_request(request).send().await.map_err(|e| {
            warn!(error = %e, "HTTP request failed");
            if e.is_timeout() {
                BridgeError::OperationFailed("Request timed out".to_string())
            } else if e.is_connect() {
                BridgeError::OperationFailed(format!("Connection failed: {}", e))
            } else {
                BridgeError::OperationFailed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_length = response.content_length();

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let reader = tokio_util::io::StreamReader::new(stream);

        Ok(HttpDownload {
            status,
            content_length,
            body: Box::new(reader),
        })
    }
}
