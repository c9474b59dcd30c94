//! reqwest-backed transport
//!
//! Forwards the request as-is, adds the bearer token, and hands back the
//! response body as a stream so server-sent events reach the client as they
//! arrive. The timeout here is the transport's own; the orchestrator applies
//! none.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::debug;

use crate::{ResponseBody, Result, Transport, TransportError, UpstreamRequest, UpstreamResponse};

pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
        bearer: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse>> + Send + 'a>> {
        Box::pin(async move {
            debug!(method = %request.method, url = %request.url, "sending upstream request");

            let response = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers)
                .bearer_auth(bearer)
                .timeout(self.timeout)
                .body(request.body)
                .send()
                .await
                .map_err(map_send_error)?;

            let status = response.status();
            let headers = response.headers().clone();
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| TransportError::Body(e.to_string())));

            Ok(UpstreamResponse {
                status,
                headers,
                body: ResponseBody::Stream(Box::pin(stream)),
            })
        })
    }
}

fn map_send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_builder() {
        TransportError::Request(e.to_string())
    } else {
        TransportError::Connect(e.to_string())
    }
}
