//! Test doubles shared by the pool's unit tests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use codex_auth::{RefreshOutcome, TokenRefresher};

/// Hands out queued outcomes in order; fails once the queue is empty.
#[derive(Default)]
pub(crate) struct ScriptedRefresher {
    outcomes: std::sync::Mutex<VecDeque<RefreshOutcome>>,
    pub(crate) calls: AtomicUsize,
}

impl ScriptedRefresher {
    pub(crate) fn with(outcomes: Vec<RefreshOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: std::sync::Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        })
    }
}

impl TokenRefresher for ScriptedRefresher {
    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RefreshOutcome::Failed {
                reason: "no scripted outcome".into(),
            });
        Box::pin(async move { outcome })
    }
}

/// Unsigned JWT carrying ChatGPT identity claims.
pub(crate) fn fake_jwt(user: &str, account: &str, email: &str) -> String {
    let payload = serde_json::json!({
        "email": email,
        "https://api.openai.com/auth": {
            "chatgpt_user_id": user,
            "chatgpt_account_id": account,
            "chatgpt_plan_type": "plus",
        }
    });
    format!(
        "h.{}.s",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
    )
}
