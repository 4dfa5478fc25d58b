//! Transport abstraction shared by the dispatcher and the remote services.
//!
//! A transport performs exactly one HTTP exchange and reports either a
//! response or a classified failure. Retry decisions are made above this
//! layer by matching on [`FailureKind`].

pub mod reqwest_transport;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use url::Url;

pub use reqwest_transport::ReqwestTransport;

/// Body placed on an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }
}

/// Fully resolved arguments for a single transport attempt.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    /// Target URL, query parameters already applied.
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub verify_tls: bool,
    pub proxy: Option<String>,
    /// Read the body incrementally instead of buffering it in one call.
    pub stream: bool,
    /// Body size ceiling in bytes. Reading stops once it is crossed.
    pub max_content_length: Option<u64>,
}

/// Raw response produced by a transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Final URL after redirects.
    pub url: Url,
}

/// Failure taxonomy the retry engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Proxy,
    Ssl,
    Connection,
    ChunkedEncoding,
    /// Body larger than the configured ceiling.
    TooLarge,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Proxy => "ProxyError",
            FailureKind::Ssl => "SSLError",
            FailureKind::Connection => "ConnectionError",
            FailureKind::ChunkedEncoding => "ChunkedEncodingError",
            FailureKind::TooLarge => "ContentTooLarge",
            FailureKind::Other => "TransportError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TransportFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportFailure {}

/// Failure for a body that grew past `limit` bytes.
pub fn too_large(limit: u64) -> TransportFailure {
    TransportFailure::new(
        FailureKind::TooLarge,
        format!("response body exceeds max_content_length of {limit} bytes"),
    )
}

/// One-shot HTTP executor.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure>;
}
