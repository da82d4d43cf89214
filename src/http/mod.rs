//! Transport seam and response handling.
//!
//! The executor only talks to a [`Transport`]; [`client::ReqwestTransport`]
//! is the production implementation. Whatever comes back is either resolved
//! into a typed [`response::Response`] or streamed to disk by
//! [`download::DownloadSink`].

pub mod client;
pub mod download;
pub mod fingerprint;
pub mod resolver;
pub mod response;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::AsyncRead;
use url::Url;

use crate::crawler::task::{HttpMethod, RequestBody};

// Re-export common types
pub use client::ReqwestTransport;
pub use download::{DownloadSink, DownloadSummary};
pub use resolver::{classify, resolve, ContentKind};
pub use response::{Metadata, Response, ResponseError, XPathValue};

/// Streamed response body
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// One attempt's worth of request, fully resolved
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: HeaderMap,

    /// Don't add `User-Agent`/`Content-Type` on the caller's behalf
    pub skip_auto_headers: bool,

    pub body: Option<RequestBody>,
    pub allow_redirects: bool,
}

/// The request as it went out
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: HeaderMap,
}

/// A cookie set by the response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

/// Response as handed back by the transport, body not yet read
pub struct RawResponse {
    /// Final URL, after redirects
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub cookies: Vec<Cookie>,
    pub request: RequestInfo,
    pub body: BodyReader,
}

/// Errors raised by a transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to read response body: {0}")]
    Body(#[from] std::io::Error),
}

impl TransportError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(e) => !e.is_builder(),
            TransportError::Connection(_) | TransportError::Body(_) => true,
            TransportError::InvalidRequest(_) => false,
        }
    }
}

/// Sends prepared requests
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: PreparedRequest) -> Result<RawResponse, TransportError>;
}
