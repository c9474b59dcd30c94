//! Transport abstraction for the upstream inference API
//!
//! The request orchestrator never talks HTTP directly. It hands an
//! `UpstreamRequest` plus the selected account's bearer token to a `Transport`
//! and gets back an `UpstreamResponse` whose body is either fully buffered or a
//! byte stream. `ReqwestTransport` is the production implementation; tests
//! script their own.

pub mod reqwest_transport;

pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use reqwest::{Method, StatusCode};
pub use reqwest_transport::ReqwestTransport;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Errors raised by a transport while sending or reading a response.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream body error: {0}")]
    Body(String),

    #[error("invalid upstream request: {0}")]
    Request(String),
}

impl TransportError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connection",
            TransportError::Body(_) => "body",
            TransportError::Request(_) => "request",
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Streaming response body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Outbound request descriptor. The bearer token travels separately.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub enum ResponseBody {
    Full(Bytes),
    Stream(BodyStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            ResponseBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Response descriptor returned by a transport.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl UpstreamResponse {
    /// Buffered response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Full(body.into()),
        }
    }

    /// In-process JSON response that never touched the network.
    pub fn synthetic(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, body.to_string())
    }

    /// Buffered body bytes, if the body is not a stream.
    pub fn full_body(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Full(b) => Some(b),
            ResponseBody::Stream(_) => None,
        }
    }

    /// Collect a streaming body so it can be inspected and still returned.
    pub async fn buffer(self) -> Result<Self> {
        let UpstreamResponse {
            status,
            headers,
            body,
        } = self;
        let bytes = collect_body(body).await?;
        Ok(Self::new(status, headers, bytes))
    }

    /// Consume the response, returning the full body.
    pub async fn into_bytes(self) -> Result<Bytes> {
        collect_body(self.body).await
    }
}

async fn collect_body(body: ResponseBody) -> Result<Bytes> {
    match body {
        ResponseBody::Full(b) => Ok(b),
        ResponseBody::Stream(mut stream) => {
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
            }
            Ok(Bytes::from(buf))
        }
    }
}

/// The outbound HTTP primitive.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Send `request` authenticated with `bearer`.
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
        bearer: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse>> + Send + 'a>>;
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("chatgpt-account-id"));
    }

    #[test]
    fn synthetic_response_is_json() {
        let resp = UpstreamResponse::synthetic(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({"error": {"type": "no_available_accounts"}}),
        );
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers["content-type"], "application/json");
        let body = resp.full_body().unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["error"]["type"], "no_available_accounts");
    }

    #[tokio::test]
    async fn buffer_collects_stream_chunks() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: one\n\n")),
            Ok(Bytes::from_static(b"data: two\n\n")),
        ];
        let resp = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: ResponseBody::Stream(Box::pin(futures_util::stream::iter(chunks))),
        };

        let buffered = resp.buffer().await.unwrap();
        assert_eq!(
            buffered.full_body().unwrap().as_ref(),
            b"data: one\n\ndata: two\n\n"
        );
    }

    #[tokio::test]
    async fn buffer_propagates_stream_error() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(TransportError::Body("connection reset".into())),
        ];
        let resp = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: ResponseBody::Stream(Box::pin(futures_util::stream::iter(chunks))),
        };

        let err = resp.into_bytes().await.unwrap_err();
        assert_eq!(err.kind(), "body");
    }
}
