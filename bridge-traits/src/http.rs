//! HTTP Client Abstraction
//!
//! Streaming fetches of remote media resources.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// HTTP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
}

/// HTTP request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            timeout: None,
        }
    }

    /// Shorthand for a plain GET of `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// Streaming response of a resource fetch.
///
/// The body is handed out as an async reader so large media files never have
/// to be buffered in memory. Non-2xx responses are still returned here; the
/// caller decides how to classify them.
pub struct HttpDownload {
    pub status: u16,
    /// Value of the `Content-Length` header when the server sent one
    pub content_length: Option<u64>,
    pub body: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
}

impl HttpDownload {
    /// Check if response status is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if response status indicates a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

impl fmt::Debug for HttpDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDownload")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Async HTTP client trait
///
/// Implementations should handle TLS, connection pooling and transport-level
/// timeouts. They must NOT retry on their own: the download queue owns the
/// retry policy and counts every attempt.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest};
///
/// async fn fetch(client: &dyn HttpClient) -> Result<u16> {
///     let response = client.download_stream(HttpRequest::get("https://cdn.example.com/a.mp3")).await?;
///     Ok(response.status)
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Start a streaming download.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Network connection fails
    /// - TLS validation fails
    /// - Request times out before headers arrive
    async fn download_stream(&self, request: HttpRequest) -> Result<HttpDownload>;
}
