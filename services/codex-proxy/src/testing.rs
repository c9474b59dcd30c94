//! In-memory collaborators for orchestrator, router and admin tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use account_pool::{AccountStore, PoolConfig};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use codex_auth::{RefreshOutcome, TokenRefresher};
use common::Clock;
use tempfile::TempDir;
use upstream::{HeaderMap, Transport, UpstreamRequest, UpstreamResponse};
use usage_tracker::{UsageConfig, UsageTracker};

use crate::notice::NoticeBoard;
use crate::orchestrator::Orchestrator;

pub(crate) const NOW: u64 = 1_700_000_000_000;
pub(crate) const UPSTREAM: &str = "https://chatgpt.test/backend-api";

/// Refresher whose every call fails with `reason`.
pub(crate) struct FailingRefresher {
    reason: String,
    pub(crate) calls: AtomicUsize,
}

impl FailingRefresher {
    pub(crate) fn new(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            reason: reason.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

impl TokenRefresher for FailingRefresher {
    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reason = self.reason.clone();
        Box::pin(async move { RefreshOutcome::Failed { reason } })
    }
}

/// What the transport saw for one call.
#[derive(Debug, Clone)]
pub(crate) struct SentRequest {
    pub(crate) url: String,
    pub(crate) bearer: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl SentRequest {
    pub(crate) fn account_id(&self) -> Option<&str> {
        self.headers
            .get(codex_auth::ACCOUNT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
    }
}

type Responder = dyn Fn(&SentRequest) -> upstream::Result<UpstreamResponse> + Send + Sync;

/// Transport that records every request and answers from a closure.
pub(crate) struct ScriptedTransport {
    respond: Box<Responder>,
    sent: std::sync::Mutex<Vec<SentRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        respond: impl Fn(&SentRequest) -> upstream::Result<UpstreamResponse>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            sent: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
        bearer: &'a str,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<UpstreamResponse>> + Send + 'a>> {
        let sent = SentRequest {
            url: request.url,
            bearer: bearer.to_string(),
            headers: request.headers,
            body: request.body,
        };
        let result = (self.respond)(&sent);
        self.sent.lock().unwrap().push(sent);
        Box::pin(async move { result })
    }
}

/// Unsigned JWT carrying ChatGPT identity claims.
pub(crate) fn fake_jwt(name: &str) -> String {
    let payload = serde_json::json!({
        "email": format!("{name}@example.com"),
        "https://api.openai.com/auth": {
            "chatgpt_user_id": format!("user-{name}"),
            "chatgpt_account_id": format!("acct-{name}"),
            "chatgpt_plan_type": "plus",
        }
    });
    format!(
        "h.{}.s",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
    )
}

pub(crate) struct Fixture {
    pub(crate) _dir: TempDir,
    pub(crate) clock: Clock,
    pub(crate) store: Arc<AccountStore>,
    pub(crate) usage: Arc<UsageTracker>,
    pub(crate) notices: Arc<NoticeBoard>,
}

impl Fixture {
    pub(crate) fn orchestrator(&self, transport: Arc<dyn Transport>) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.usage.clone(),
            transport,
            self.notices.clone(),
            UPSTREAM.to_string(),
        )
    }
}

/// A pool of sticky accounts named after `names`, each holding a token valid
/// for an hour.
pub(crate) async fn fixture(names: &[&str]) -> Fixture {
    fixture_with(names, FailingRefresher::new("refresh unavailable")).await
}

pub(crate) async fn fixture_with(names: &[&str], refresher: Arc<dyn TokenRefresher>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let clock = Clock::manual(NOW);
    let config = PoolConfig {
        strategy: account_pool::Strategy::Sticky,
        ..PoolConfig::default()
    };
    let store = Arc::new(
        AccountStore::load(
            dir.path().join("accounts.json"),
            config,
            refresher,
            clock.clone(),
        )
        .await,
    );
    for name in names {
        store
            .add_or_update_account(
                None,
                format!("rt_{name}"),
                Some(fake_jwt(name)),
                Some(NOW + 3_600_000),
            )
            .await
            .unwrap();
    }
    let usage = Arc::new(
        UsageTracker::load(
            dir.path().join("usage.json"),
            UsageConfig::default(),
            clock.clone(),
        )
        .await,
    );
    let notices = Arc::new(NoticeBoard::new(Duration::from_secs(30), clock.clone()));
    Fixture {
        _dir: dir,
        clock,
        store,
        usage,
        notices,
    }
}
