//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, reads the body and
//! hands the request to the orchestrator. The orchestrator's response is
//! returned with its upstream status; streamed bodies stay streamed.

use std::time::Instant;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, instrument};
use upstream::{HeaderMap, ResponseBody, UpstreamResponse, is_hop_by_hop};

use crate::metrics;
use crate::orchestrator::{Orchestrator, ProxyRequest};

/// Request bodies above this size are rejected.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy an inbound request through the account pool.
#[instrument(
    skip_all,
    fields(
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    )
)]
pub async fn proxy_request(
    orchestrator: &Orchestrator,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.to_string();

    let mut headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            metrics::record_request(400, &method, started.elapsed().as_secs_f64());
            return error_response(
                StatusCode::BAD_REQUEST,
                "proxy_error",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let request = ProxyRequest {
        method: parts.method,
        path_and_query,
        headers,
        body,
    };

    match orchestrator.execute(request, &request_id).await {
        Ok(response) => {
            metrics::record_request(
                response.status.as_u16(),
                &method,
                started.elapsed().as_secs_f64(),
            );
            into_response(response, &request_id)
        }
        Err(e) => {
            metrics::record_request(502, &method, started.elapsed().as_secs_f64());
            error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("upstream error: {e}"),
                &request_id,
            )
        }
    }
}

/// Convert an upstream response to an axum response, dropping hop-by-hop
/// headers and any stale content length.
fn into_response(upstream: UpstreamResponse, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) && *name != axum::http::header::CONTENT_LENGTH {
            response = response.header(name, value);
        }
    }
    let body = match upstream.body {
        ResponseBody::Full(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };
    response.body(body).unwrap_or_else(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            &format!("response build error: {e}"),
            request_id,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use upstream::HeaderValue;

    #[tokio::test]
    async fn test_error_response_format() {
        let resp = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "proxy_error",
            "no accounts",
            "req_abc123",
        );
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "proxy_error");
        assert_eq!(json["error"]["message"], "no accounts");
        assert_eq!(json["error"]["request_id"], "req_abc123");
    }

    #[tokio::test]
    async fn upstream_headers_are_filtered() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("content-length", HeaderValue::from_static("999"));
        headers.insert("x-codex-primary-used-percent", HeaderValue::from_static("12"));
        let upstream = UpstreamResponse::new(StatusCode::OK, headers, Bytes::from_static(b"{}"));

        let resp = into_response(upstream, "req_1");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("connection").is_none());
        assert_ne!(
            resp.headers().get("content-length").map(|v| v.as_bytes()),
            Some(&b"999"[..])
        );
        assert_eq!(resp.headers()["x-codex-primary-used-percent"], "12");

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"{}");
    }
}
