//! Codex Responses API adapter
//!
//! Clients speak the public Responses API; the ChatGPT backend serves the same
//! shape under `/codex/responses` but only accepts `store: false` streaming
//! requests. The adapter rewrites the target and body on the way out and,
//! for clients that did not ask for a stream, collapses the SSE stream back
//! into the final response object on the way in.

use account_pool::is_usage_limit_error;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;
use upstream::{HeaderMap, HeaderValue, StatusCode, UpstreamResponse};

const RESPONSES_PATHS: &[&str] = &["/v1/responses", "/responses"];
const CODEX_RESPONSES_PATH: &str = "/codex/responses";

/// Outbound request after rewriting, plus what the orchestrator needs to know
/// about it.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub body: Bytes,
    pub model: Option<String>,
    /// Cache-affinity key (`prompt_cache_key`), sent as conversation/session id.
    pub cache_key: Option<String>,
    /// Whether this is a Responses API call.
    pub is_responses: bool,
    pub client_wants_stream: bool,
}

/// Rewrite a client request for the backend at `upstream_base`.
///
/// Bodies that are not JSON objects are forwarded untouched and carry no
/// model.
pub fn prepare(upstream_base: &str, path_and_query: &str, body: &Bytes) -> PreparedRequest {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };
    let is_responses = RESPONSES_PATHS.contains(&path.trim_end_matches('/'));

    let url = if is_responses {
        match query {
            Some(q) => format!("{upstream_base}{CODEX_RESPONSES_PATH}?{q}"),
            None => format!("{upstream_base}{CODEX_RESPONSES_PATH}"),
        }
    } else {
        format!("{upstream_base}{path_and_query}")
    };

    let mut json = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => {
            return PreparedRequest {
                url,
                body: body.clone(),
                model: None,
                cache_key: None,
                is_responses,
                client_wants_stream: false,
            };
        }
    };

    let model = json.get("model").and_then(Value::as_str).map(str::to_string);
    let cache_key = json
        .get("prompt_cache_key")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    let client_wants_stream = json.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let body = if is_responses {
        json.insert("store".into(), Value::Bool(false));
        json.insert("stream".into(), Value::Bool(true));
        match serde_json::to_vec(&json) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => body.clone(),
        }
    } else {
        body.clone()
    };

    PreparedRequest {
        url,
        body,
        model,
        cache_key,
        is_responses,
        client_wants_stream,
    }
}

/// Post-process a 2xx response.
///
/// Streams pass through for streaming clients. Otherwise the stream is
/// collected and the `response` object of the terminal event returned as
/// JSON; a body with no terminal event is returned as collected.
pub async fn finish_success(
    response: UpstreamResponse,
    prepared: &PreparedRequest,
) -> upstream::Result<UpstreamResponse> {
    if !prepared.is_responses || prepared.client_wants_stream {
        return Ok(response);
    }

    let status = response.status;
    let mut headers = response.headers.clone();
    let body = response.into_bytes().await?;

    let Some(final_response) = final_response_event(&body) else {
        debug!("no terminal event in upstream stream, returning collected body");
        return Ok(UpstreamResponse::new(status, headers, body));
    };

    headers.remove("content-length");
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    Ok(UpstreamResponse::new(status, headers, final_response.to_string()))
}

/// Post-process a non-2xx response that is not retried.
///
/// A 404 carrying a usage-limit error is reported as 429 so callers see one
/// overload signal.
pub async fn finish_error(response: UpstreamResponse) -> upstream::Result<UpstreamResponse> {
    if response.status != StatusCode::NOT_FOUND {
        return Ok(response);
    }

    let buffered = response.buffer().await?;
    let is_usage_limit = buffered
        .full_body()
        .map(|b| is_usage_limit_error(&String::from_utf8_lossy(b)))
        .unwrap_or(false);
    if !is_usage_limit {
        return Ok(buffered);
    }

    debug!("remapping usage-limit 404 to 429");
    let UpstreamResponse { headers, body, .. } = buffered;
    Ok(UpstreamResponse {
        status: StatusCode::TOO_MANY_REQUESTS,
        headers,
        body,
    })
}

/// The `response` object of the last `response.completed` or
/// `response.done` SSE event.
fn final_response_event(body: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(body);
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty() && *data != "[DONE]")
        .filter_map(|data| serde_json::from_str::<Value>(data).ok())
        .filter(|event| {
            matches!(
                event.get("type").and_then(Value::as_str),
                Some("response.completed" | "response.done")
            )
        })
        .filter_map(|mut event| event.get_mut("response").map(Value::take))
        .last()
}

/// Copy of `headers` suitable for building the outbound request.
pub fn outbound_headers(client: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in client {
        if upstream::is_hop_by_hop(name.as_str()) {
            continue;
        }
        match name.as_str() {
            "host" | "authorization" | "content-length" => continue,
            _ => {
                headers.append(name.clone(), value.clone());
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use upstream::ResponseBody;

    const BASE: &str = "https://chatgpt.com/backend-api";

    fn body(json: Value) -> Bytes {
        Bytes::from(json.to_string())
    }

    #[test]
    fn responses_paths_are_rewritten() {
        let b = body(serde_json::json!({"model": "gpt-5"}));
        for path in ["/v1/responses", "/responses", "/v1/responses/"] {
            let prepared = prepare(BASE, path, &b);
            assert_eq!(prepared.url, "https://chatgpt.com/backend-api/codex/responses");
            assert!(prepared.is_responses);
        }

        let prepared = prepare(BASE, "/v1/responses?trace=1", &b);
        assert_eq!(
            prepared.url,
            "https://chatgpt.com/backend-api/codex/responses?trace=1"
        );
    }

    #[test]
    fn other_paths_forward_verbatim() {
        let prepared = prepare(BASE, "/wham/usage?x=1", &Bytes::new());
        assert_eq!(prepared.url, "https://chatgpt.com/backend-api/wham/usage?x=1");
        assert!(!prepared.is_responses);
        assert!(prepared.model.is_none());
    }

    #[test]
    fn body_is_forced_to_unstored_stream() {
        let b = body(serde_json::json!({
            "model": "gpt-5-codex",
            "input": "hi",
            "store": true,
            "prompt_cache_key": "conv-42",
        }));
        let prepared = prepare(BASE, "/v1/responses", &b);

        let sent: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert_eq!(sent["store"], false);
        assert_eq!(sent["stream"], true);
        assert_eq!(sent["input"], "hi");
        assert_eq!(prepared.model.as_deref(), Some("gpt-5-codex"));
        assert_eq!(prepared.cache_key.as_deref(), Some("conv-42"));
        assert!(!prepared.client_wants_stream);
    }

    #[test]
    fn client_stream_wish_is_remembered() {
        let b = body(serde_json::json!({"model": "gpt-5", "stream": true}));
        assert!(prepare(BASE, "/responses", &b).client_wants_stream);
    }

    #[test]
    fn unparseable_body_passes_through_without_model() {
        let b = Bytes::from_static(b"not json");
        let prepared = prepare(BASE, "/v1/responses", &b);
        assert_eq!(prepared.body, b);
        assert!(prepared.model.is_none());
        assert!(prepared.cache_key.is_none());
    }

    #[test]
    fn outbound_headers_drop_client_auth_and_hop_by_hop() {
        let mut client = HeaderMap::new();
        client.insert("authorization", HeaderValue::from_static("Bearer local"));
        client.insert("host", HeaderValue::from_static("127.0.0.1:8787"));
        client.insert("connection", HeaderValue::from_static("keep-alive"));
        client.insert("content-type", HeaderValue::from_static("application/json"));

        let headers = outbound_headers(&client);
        assert!(headers.get("authorization").is_none());
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers["content-type"], "application/json");
    }

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {e}\n\n", e["type"].as_str().unwrap()))
            .collect()
    }

    fn streaming(body: String) -> UpstreamResponse {
        let chunks: Vec<upstream::Result<Bytes>> = body
            .into_bytes()
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: ResponseBody::Stream(Box::pin(futures_util::stream::iter(chunks))),
        }
    }

    #[tokio::test]
    async fn non_streaming_client_gets_final_response_object() {
        let stream = sse(&[
            serde_json::json!({
                "type": "response.created",
                "response": {"id": "resp_1", "status": "in_progress"}
            }),
            serde_json::json!({"type": "response.output_text.delta", "delta": "Hel"}),
            serde_json::json!({
                "type": "response.completed",
                "response": {"id": "resp_1", "status": "completed"}
            }),
        ]);
        let prepared = prepare(BASE, "/v1/responses", &body(serde_json::json!({"model": "m"})));

        let out = finish_success(streaming(stream), &prepared).await.unwrap();
        assert_eq!(out.headers["content-type"], "application/json");
        let json: Value = serde_json::from_slice(out.full_body().unwrap()).unwrap();
        assert_eq!(json["id"], "resp_1");
        assert_eq!(json["status"], "completed");
    }

    #[tokio::test]
    async fn streaming_client_gets_stream_untouched() {
        let prepared = prepare(
            BASE,
            "/v1/responses",
            &body(serde_json::json!({"model": "m", "stream": true})),
        );
        let out = finish_success(streaming("data: x\n\n".into()), &prepared)
            .await
            .unwrap();
        assert!(matches!(out.body, ResponseBody::Stream(_)));
    }

    #[tokio::test]
    async fn stream_without_terminal_event_is_returned_collected() {
        let prepared = prepare(BASE, "/v1/responses", &body(serde_json::json!({"model": "m"})));
        let partial = "data: {\"type\":\"response.created\"}\n\n".to_string();
        let out = finish_success(streaming(partial), &prepared).await.unwrap();
        assert_eq!(out.headers["content-type"], "text/event-stream");
        assert!(out.full_body().unwrap().starts_with(b"data:"));
    }

    #[tokio::test]
    async fn usage_limit_404_becomes_429() {
        let resp = UpstreamResponse::synthetic(
            StatusCode::NOT_FOUND,
            &serde_json::json!({"error": {"code": "usage_limit_reached", "message": "limit"}}),
        );
        let out = finish_error(resp).await.unwrap();
        assert_eq!(out.status, StatusCode::TOO_MANY_REQUESTS);
        let json: Value = serde_json::from_slice(out.full_body().unwrap()).unwrap();
        assert_eq!(json["error"]["code"], "usage_limit_reached");
    }

    #[tokio::test]
    async fn plain_404_is_kept() {
        let resp = UpstreamResponse::synthetic(
            StatusCode::NOT_FOUND,
            &serde_json::json!({"error": {"message": "no such route"}}),
        );
        let out = finish_error(resp).await.unwrap();
        assert_eq!(out.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn other_errors_pass_through() {
        let resp = UpstreamResponse::synthetic(
            StatusCode::INTERNAL_SERVER_ERROR,
            &serde_json::json!({"error": {"message": "usage limit"}}),
        );
        let out = finish_error(resp).await.unwrap();
        assert_eq!(out.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
