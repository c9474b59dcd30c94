//! Request orchestration across the account pool
//!
//! One logical request is an explicit loop over `Attempt { account,
//! retry_count }`. Each pass validates the account's token, sends once, and
//! classifies the response:
//!
//! - 429: mark the account limited and move on while
//!   `retry_count < pool_size - 1`, else return the 429
//! - 401: count a credential failure and move on once, else return the 401
//! - other non-2xx: error post-processing, returned
//! - 2xx: success post-processing, returned
//!
//! Token failures reselect without spending the retry budget; they are bounded
//! separately by `pool_size * FAILURE_THRESHOLD + 1` hops.

use std::sync::Arc;

use account_pool::{
    Account, AccountHandle, AccountStore, FAILURE_THRESHOLD, ResponseClass, classify_status,
    retry_after_ms,
};
use bytes::Bytes;
use common::best_effort;
use tracing::{debug, error, info, instrument, warn};
use upstream::{
    HeaderMap, HeaderValue, Method, StatusCode, Transport, UpstreamRequest, UpstreamResponse,
};
use usage_tracker::UsageTracker;

use crate::dialect::{self, PreparedRequest};
use crate::metrics::{self, FailoverReason};
use crate::notice::NoticeBoard;

const CONVERSATION_ID: &str = "conversation_id";
const SESSION_ID: &str = "session_id";

/// Client request as received by the listener, hop-by-hop headers removed.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct Attempt {
    account: Account,
    retry_count: usize,
}

pub struct Orchestrator {
    store: Arc<AccountStore>,
    usage: Arc<UsageTracker>,
    transport: Arc<dyn Transport>,
    notices: Arc<NoticeBoard>,
    upstream_base: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<AccountStore>,
        usage: Arc<UsageTracker>,
        transport: Arc<dyn Transport>,
        notices: Arc<NoticeBoard>,
        upstream_base: String,
    ) -> Self {
        Self {
            store,
            usage,
            transport,
            notices,
            upstream_base,
        }
    }

    /// Run one logical request to completion.
    ///
    /// Upstream statuses, including exhausted 429s and a second 401, come back
    /// as `Ok`. Only transport failures are `Err`.
    #[instrument(skip_all, fields(request_id = %request_id, model = tracing::field::Empty))]
    pub async fn execute(
        &self,
        request: ProxyRequest,
        request_id: &str,
    ) -> upstream::Result<UpstreamResponse> {
        let prepared =
            dialect::prepare(&self.upstream_base, &request.path_and_query, &request.body);
        let model = prepared.model.as_deref();
        if let Some(m) = model {
            tracing::Span::current().record("model", m);
        }

        let pool_size = self.store.len().await;
        let token_hop_limit = pool_size * FAILURE_THRESHOLD as usize + 1;
        let mut token_hops = 0;

        let Some(account) = self.store.select_account(model).await else {
            warn!("no account available");
            return Ok(no_available_accounts(request_id));
        };
        let mut attempt = Attempt {
            account,
            retry_count: 0,
        };

        loop {
            let handle = attempt.account.handle;
            let Some(account) = self.ready_account(handle).await else {
                token_hops += 1;
                metrics::record_failover(FailoverReason::TokenInvalid);
                if token_hops > token_hop_limit {
                    warn!(token_hops, "giving up on token validation");
                    return Ok(no_available_accounts(request_id));
                }
                match self.store.select_account_excluding(model, &[handle]).await {
                    Some(next) => {
                        debug!(
                            from = attempt.account.index,
                            to = next.index,
                            "token unusable, reselecting"
                        );
                        attempt.account = next;
                        continue;
                    }
                    None => {
                        warn!("no account with a usable token");
                        return Ok(no_available_accounts(request_id));
                    }
                }
            };
            attempt.account = account;

            debug!(
                account_index = attempt.account.index,
                retry_count = attempt.retry_count,
                "sending upstream attempt"
            );
            let response = self.send(&attempt.account, &request, &prepared).await?;
            best_effort(
                "record usage",
                self.usage
                    .record_from_headers(&attempt.account, &response.headers),
            )
            .await;

            match classify_status(response.status.as_u16()) {
                ResponseClass::RateLimited => {
                    let response = response.buffer().await?;
                    let wait_ms = {
                        let retry_after = response
                            .headers
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok());
                        let body = response
                            .full_body()
                            .map(|b| String::from_utf8_lossy(b).into_owned())
                            .unwrap_or_default();
                        retry_after_ms(retry_after, &body, self.store.clock().now_millis())
                    };
                    self.store.mark_rate_limited(handle, wait_ms, model).await;

                    if attempt.retry_count + 1 < pool_size
                        && let Some(next) = self.reselect(model, handle).await
                    {
                        metrics::record_failover(FailoverReason::RateLimited);
                        self.notices.account_switched(&next.label());
                        attempt = Attempt {
                            account: next,
                            retry_count: attempt.retry_count + 1,
                        };
                        continue;
                    }
                    info!(
                        retry_count = attempt.retry_count,
                        wait_ms, "rate limited with no retry budget left"
                    );
                    self.notices.all_rate_limited(wait_ms);
                    return Ok(response);
                }
                ResponseClass::Unauthorized if attempt.retry_count < 1 => {
                    self.store
                        .mark_refresh_failed(handle, "401 Unauthorized")
                        .await;
                    let Some(next) = self.reselect(model, handle).await else {
                        return Ok(response);
                    };
                    metrics::record_failover(FailoverReason::Unauthorized);
                    if next.handle != handle {
                        self.notices.account_switched(&next.label());
                    }
                    attempt = Attempt {
                        account: next,
                        retry_count: attempt.retry_count + 1,
                    };
                }
                ResponseClass::Unauthorized => return Ok(response),
                ResponseClass::Failed => return dialect::finish_error(response).await,
                ResponseClass::Success => {
                    return dialect::finish_success(response, &prepared).await;
                }
            }
        }
    }

    /// The account with a usable access token, or `None` when validation or
    /// refresh failed.
    async fn ready_account(&self, handle: AccountHandle) -> Option<Account> {
        if !self.store.ensure_valid_token(handle).await {
            return None;
        }
        self.store
            .account(handle)
            .await
            .filter(|a| a.access_token.is_some())
    }

    /// Prefer an account other than `current`; fall back to whatever the
    /// selector picks when `current` is the only candidate.
    async fn reselect(&self, model: Option<&str>, current: AccountHandle) -> Option<Account> {
        match self.store.select_account_excluding(model, &[current]).await {
            Some(next) => Some(next),
            None => self.store.select_account(model).await,
        }
    }

    async fn send(
        &self,
        account: &Account,
        request: &ProxyRequest,
        prepared: &PreparedRequest,
    ) -> upstream::Result<UpstreamResponse> {
        let account_id = self
            .store
            .resolve_account_id(account.handle)
            .await
            .and_then(|id| HeaderValue::from_str(&id).ok());
        let (Some(account_id), Some(token)) = (account_id, account.access_token.as_ref()) else {
            warn!(
                account_index = account.index,
                "account has no ChatGPT account id"
            );
            return Ok(UpstreamResponse::synthetic(
                StatusCode::UNAUTHORIZED,
                &serde_json::json!({
                    "error": {
                        "type": "missing_account_id",
                        "message": format!("{} has no ChatGPT account id", account.label()),
                    }
                }),
            ));
        };

        let mut headers = dialect::outbound_headers(&request.headers);
        headers.insert(codex_auth::ACCOUNT_ID_HEADER, account_id);
        headers.insert(
            "openai-beta",
            HeaderValue::from_static(codex_auth::RESPONSES_BETA),
        );
        headers.insert("originator", HeaderValue::from_static(codex_auth::ORIGINATOR));
        if prepared.is_responses {
            headers.insert("accept", HeaderValue::from_static("text/event-stream"));
            headers.insert("content-type", HeaderValue::from_static("application/json"));
        }
        match prepared
            .cache_key
            .as_deref()
            .and_then(|k| HeaderValue::from_str(k).ok())
        {
            Some(key) => {
                headers.insert(CONVERSATION_ID, key.clone());
                headers.insert(SESSION_ID, key);
            }
            None => {
                headers.remove(CONVERSATION_ID);
                headers.remove(SESSION_ID);
            }
        }

        let upstream_request = UpstreamRequest {
            method: request.method.clone(),
            url: prepared.url.clone(),
            headers,
            body: prepared.body.clone(),
        };
        self.transport
            .send(upstream_request, token.expose())
            .await
            .inspect_err(|e| {
                metrics::record_upstream_error(e.kind());
                error!(account_index = account.index, error = %e, "upstream request failed");
            })
    }
}

fn no_available_accounts(request_id: &str) -> UpstreamResponse {
    UpstreamResponse::synthetic(
        StatusCode::SERVICE_UNAVAILABLE,
        &serde_json::json!({
            "error": {
                "type": "no_available_accounts",
                "message": "no account is available to serve this request",
                "request_id": request_id,
            }
        }),
    )
}
