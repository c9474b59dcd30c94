//! Admin API for account management
//!
//! Runs on its own listener (`proxy.admin_addr`) and is disabled unless
//! configured. Never exposes tokens.
//!
//! Endpoints:
//! - GET    /admin/accounts          account status report with usage bars
//! - POST   /admin/accounts          add or update an account from tokens
//! - POST   /admin/accounts/import   import the configured foreign credential
//! - DELETE /admin/accounts/{index}  remove an account, re-indexing the rest
//! - GET    /admin/status            plain-text status report
//! - POST   /admin/usage/refresh     query backend usage for accounts with a current token

use std::path::PathBuf;
use std::sync::Arc;

use account_pool::{Account, AccountStore, Error as PoolError};
use anyhow::Context;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{info, warn};
use upstream::{HeaderMap, HeaderValue, Method, Transport, UpstreamRequest};
use usage_tracker::{UsageTracker, UsageUpdate, normalize_backend_usage};

/// Externally owned credential file offered for import.
#[derive(Debug, Clone)]
pub struct ForeignSource {
    pub path: PathBuf,
    pub provider_key: String,
}

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    store: Arc<AccountStore>,
    usage: Arc<UsageTracker>,
    transport: Arc<dyn Transport>,
    upstream_base: String,
    foreign: Option<ForeignSource>,
}

impl AdminState {
    pub fn new(
        store: Arc<AccountStore>,
        usage: Arc<UsageTracker>,
        transport: Arc<dyn Transport>,
        upstream_base: String,
        foreign: Option<ForeignSource>,
    ) -> Self {
        Self {
            store,
            usage,
            transport,
            upstream_base,
            foreign,
        }
    }
}

/// Build the admin axum router with all account management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts).post(add_account))
        .route("/admin/accounts/import", post(import_account))
        .route("/admin/accounts/{index}", delete(delete_account))
        .route("/admin/status", get(status_report))
        .route("/admin/usage/refresh", post(refresh_usage))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/accounts: every account with readiness, limits and usage.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let summary = state.store.summary().await;
    let mut accounts = Vec::new();
    for row in state.store.status_rows().await {
        let account = &row.account;
        accounts.push(serde_json::json!({
            "index": account.index,
            "active": row.active,
            "state": row.state,
            "label": account.label(),
            "email": account.email,
            "plan_type": account.plan_type,
            "consecutive_failures": account.consecutive_failures,
            "last_refresh_error": account.last_refresh_error,
            "global_rate_limit_reset": account.global_rate_limit_reset,
            "rate_limit_resets": account.rate_limit_resets,
            "last_used": account.last_used,
            "usage": state.usage.get_snapshot(account).await,
            "usage_report": state.usage.render(account).await,
        }));
    }

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "health": summary.health(),
            "summary": summary,
            "accounts": accounts,
        }),
    )
}

/// GET /admin/status: the same report as text, one block per account.
async fn status_report(State(state): State<AdminState>) -> impl IntoResponse {
    let summary = state.store.summary().await;
    let mut out = format!(
        "Accounts: {} total, {} ready, {} rate limited, {} failing\n",
        summary.total, summary.ready, summary.rate_limited, summary.failing
    );
    for row in state.store.status_rows().await {
        let account = &row.account;
        let marker = if row.active { '*' } else { ' ' };
        let plan = account.plan_type.as_deref().unwrap_or("unknown plan");
        out.push_str(&format!(
            "{marker} [{}] {} ({plan}) {}\n",
            account.index,
            account.label(),
            row.state.as_str()
        ));
        for line in state.usage.render(account).await.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        out,
    )
}

/// Request body for adding an account.
#[derive(Deserialize)]
struct AddAccountRequest {
    #[serde(default)]
    email: Option<String>,
    refresh_token: String,
    #[serde(default)]
    access_token: Option<String>,
    /// Access token expiry, unix milliseconds
    #[serde(default)]
    expires_at: Option<u64>,
}

/// POST /admin/accounts: add a new account or update the matching one.
async fn add_account(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddAccountRequest>,
) -> impl IntoResponse {
    match state
        .store
        .add_or_update_account(body.email, body.refresh_token, body.access_token, body.expires_at)
        .await
    {
        Ok(account) => {
            info!(account_index = account.index, "account stored via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "index": account.index,
                    "label": account.label(),
                    "account_id": account.account_id,
                    "status": "stored",
                }),
            )
        }
        Err(PoolError::Credential(msg)) => json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": msg }),
        ),
        Err(e) => {
            warn!(error = %e, "failed to store account");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("failed to store account: {e}") }),
            )
        }
    }
}

/// POST /admin/accounts/import: import the configured foreign credential.
async fn import_account(State(state): State<AdminState>) -> impl IntoResponse {
    let Some(source) = &state.foreign else {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "no foreign credential file configured" }),
        );
    };

    let imported = state
        .store
        .import_foreign_credential(&source.path, &source.provider_key)
        .await;
    info!(path = %source.path.display(), imported, "foreign credential import");
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "imported": imported,
            "accounts": state.store.len().await,
        }),
    )
}

/// DELETE /admin/accounts/{index}: remove an account from the pool.
async fn delete_account(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    let Some(account) = state.store.account_at(index).await else {
        return json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("no account at index {index}") }),
        );
    };

    match state.store.remove_account(account.handle).await {
        Ok(true) => {
            info!(account_index = index, "account removed via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "removed": index,
                    "label": account.label(),
                    "remaining": state.store.len().await,
                }),
            )
        }
        Ok(false) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("no account at index {index}") }),
        ),
        Err(e) => {
            warn!(account_index = index, error = %e, "account removal failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("failed to remove account: {e}") }),
            )
        }
    }
}

/// POST /admin/usage/refresh: pull usage from the backend for every account
/// whose access token is current. Accounts needing a refresh are skipped.
async fn refresh_usage(State(state): State<AdminState>) -> impl IntoResponse {
    let now = state.store.clock().now_millis();
    let (mut refreshed, mut skipped, mut failed) = (0, 0, 0);

    for account in state.store.accounts().await {
        if account.is_failing() || !account.has_current_token(now) {
            skipped += 1;
            continue;
        }
        let result = match query_backend_usage(&state, &account).await {
            Ok(update) => state
                .usage
                .record_from_backend_query(&account, &update)
                .await
                .context("recording usage"),
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => refreshed += 1,
            Err(e) => {
                warn!(
                    account_index = account.index,
                    error = %format!("{e:#}"),
                    "usage refresh failed"
                );
                failed += 1;
            }
        }
    }

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "refreshed": refreshed,
            "skipped": skipped,
            "failed": failed,
        }),
    )
}

async fn query_backend_usage(
    state: &AdminState,
    account: &Account,
) -> anyhow::Result<UsageUpdate> {
    let account_id = state
        .store
        .resolve_account_id(account.handle)
        .await
        .context("no ChatGPT account id")?;
    let token = account
        .access_token
        .as_ref()
        .context("no access token")?;

    let mut headers = HeaderMap::new();
    headers.insert(
        codex_auth::ACCOUNT_ID_HEADER,
        HeaderValue::from_str(&account_id).context("account id is not a header value")?,
    );
    headers.insert("accept", HeaderValue::from_static("application/json"));
    headers.insert("originator", HeaderValue::from_static(codex_auth::ORIGINATOR));

    let request = UpstreamRequest {
        method: Method::GET,
        url: format!("{}{}", state.upstream_base, codex_auth::USAGE_PATH),
        headers,
        body: Bytes::new(),
    };
    let response = state.transport.send(request, token.expose()).await?;
    if !response.status.is_success() {
        anyhow::bail!("usage endpoint returned {}", response.status);
    }
    let body = response.into_bytes().await?;
    let payload: serde_json::Value =
        serde_json::from_slice(&body).context("usage payload is not JSON")?;
    Ok(normalize_backend_usage(
        &payload,
        state.store.clock().now_millis(),
    ))
}
