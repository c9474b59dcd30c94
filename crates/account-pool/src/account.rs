//! Account records and the persisted pool snapshot
//!
//! An `Account` is one OAuth identity able to issue upstream requests. Its
//! runtime state (rate-limit windows, failure counter) lives next to its
//! credentials so the whole pool serializes as one versioned document:
//!
//! ```json
//! { "version": 1, "accounts": [ ... ], "activeAccountIndex": 0 }
//! ```

use std::collections::BTreeMap;

use codex_auth::AccountClaims;
use common::Secret;
use serde::{Deserialize, Serialize};

/// Pool file format version. Any other version is discarded on load.
pub const POOL_FORMAT_VERSION: u32 = 1;

/// Consecutive failures at which an account stops being selectable.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Process-local account identity.
///
/// Indices shift when accounts are removed and tokens rotate on refresh, so
/// callers holding an account across an await point refer to it by handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AccountHandle(pub(crate) u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip)]
    pub handle: AccountHandle,
    /// Dense position in the pool, always `0..len`
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<String>,
    pub refresh_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<Secret<String>>,
    /// Access token expiry, unix ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Model id -> reset time (unix ms)
    #[serde(default)]
    pub rate_limit_resets: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_rate_limit_reset: Option<u64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    #[serde(default)]
    pub added_at: u64,
    /// Advisory in-process flag, never persisted
    #[serde(skip)]
    pub is_refreshing: bool,
}

impl Account {
    pub(crate) fn new(
        handle: AccountHandle,
        index: usize,
        refresh_token: Secret<String>,
        now: u64,
    ) -> Self {
        Self {
            handle,
            index,
            email: None,
            user_id: None,
            account_id: None,
            plan_type: None,
            refresh_token,
            access_token: None,
            expires_at: None,
            rate_limit_resets: BTreeMap::new(),
            global_rate_limit_reset: None,
            consecutive_failures: 0,
            last_refresh_error: None,
            last_used: None,
            added_at: now,
            is_refreshing: false,
        }
    }

    /// Whether the failure counter has hit the ceiling.
    pub fn is_failing(&self) -> bool {
        self.consecutive_failures >= FAILURE_THRESHOLD
    }

    /// Whether a rate limit that applies to `model` is still in force.
    pub fn is_rate_limited(&self, model: Option<&str>, per_model: bool, now: u64) -> bool {
        self.reset_time(model, per_model) > now
    }

    /// Latest reset time that applies to `model`, 0 when nothing is recorded.
    pub fn reset_time(&self, model: Option<&str>, per_model: bool) -> u64 {
        let global = self.global_rate_limit_reset.unwrap_or(0);
        let model_reset = match (per_model, model) {
            (true, Some(m)) => self.rate_limit_resets.get(m).copied().unwrap_or(0),
            _ => 0,
        };
        global.max(model_reset)
    }

    /// Selectable right now for `model`.
    pub fn is_available(&self, model: Option<&str>, per_model: bool, now: u64) -> bool {
        !self.is_failing() && !self.is_rate_limited(model, per_model, now)
    }

    /// Holds an access token that has not expired yet. Tokens without a
    /// recorded expiry count as current.
    pub fn has_current_token(&self, now: u64) -> bool {
        self.access_token.is_some() && self.expires_at.is_none_or(|expires| expires > now)
    }

    /// Drop rate-limit entries whose reset time has passed.
    pub fn clear_expired_limits(&mut self, now: u64) {
        self.rate_limit_resets.retain(|_, reset| *reset > now);
        if self.global_rate_limit_reset.is_some_and(|reset| reset <= now) {
            self.global_rate_limit_reset = None;
        }
    }

    /// Fill identity fields from decoded token claims. The email is only taken
    /// from claims when none is known yet.
    pub fn apply_claims(&mut self, claims: &AccountClaims) {
        if claims.account_id.is_some() {
            self.account_id = claims.account_id.clone();
        }
        if claims.user_id.is_some() {
            self.user_id = claims.user_id.clone();
        }
        if claims.plan_type.is_some() {
            self.plan_type = claims.plan_type.clone();
        }
        if self.email.is_none() {
            self.email = claims.email.clone();
        }
    }

    /// Human-readable identity for logs and status output.
    pub fn label(&self) -> String {
        self.email
            .clone()
            .or_else(|| self.account_id.clone())
            .unwrap_or_else(|| format!("account {}", self.index + 1))
    }
}

/// The persisted unit: the whole pool plus the active index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub version: u32,
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub active_account_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new(AccountHandle(1), 0, Secret::from("rt_1"), 0)
    }

    #[test]
    fn model_limit_only_applies_with_per_model_tracking() {
        let mut a = account();
        a.rate_limit_resets.insert("gpt-5".into(), 2_000);

        assert!(a.is_rate_limited(Some("gpt-5"), true, 1_000));
        assert!(!a.is_rate_limited(Some("gpt-5-codex"), true, 1_000));
        assert!(!a.is_rate_limited(Some("gpt-5"), false, 1_000));
        assert!(!a.is_rate_limited(None, true, 1_000));
    }

    #[test]
    fn global_limit_applies_to_every_model() {
        let mut a = account();
        a.global_rate_limit_reset = Some(5_000);
        assert!(a.is_rate_limited(None, true, 1_000));
        assert!(a.is_rate_limited(Some("gpt-5"), false, 1_000));
        assert!(!a.is_rate_limited(Some("gpt-5"), true, 5_000));
    }

    #[test]
    fn reset_time_is_max_of_global_and_model() {
        let mut a = account();
        a.global_rate_limit_reset = Some(3_000);
        a.rate_limit_resets.insert("m".into(), 7_000);
        assert_eq!(a.reset_time(Some("m"), true), 7_000);
        assert_eq!(a.reset_time(Some("other"), true), 3_000);
        assert_eq!(account().reset_time(Some("m"), true), 0);
    }

    #[test]
    fn failing_accounts_are_unavailable() {
        let mut a = account();
        a.consecutive_failures = FAILURE_THRESHOLD - 1;
        assert!(a.is_available(None, true, 0));
        a.consecutive_failures = FAILURE_THRESHOLD;
        assert!(!a.is_available(None, true, 0));
    }

    #[test]
    fn current_token_needs_access_token_and_future_expiry() {
        let mut a = account();
        assert!(!a.has_current_token(1_000));

        a.access_token = Some(Secret::new("at".to_string()));
        assert!(a.has_current_token(1_000));

        a.expires_at = Some(1_000);
        assert!(!a.has_current_token(1_000));
        assert!(a.has_current_token(999));
    }

    #[test]
    fn clear_expired_limits_keeps_future_entries() {
        let mut a = account();
        a.rate_limit_resets.insert("old".into(), 100);
        a.rate_limit_resets.insert("new".into(), 10_000);
        a.global_rate_limit_reset = Some(500);
        a.clear_expired_limits(1_000);

        assert_eq!(a.rate_limit_resets.len(), 1);
        assert!(a.rate_limit_resets.contains_key("new"));
        assert!(a.global_rate_limit_reset.is_none());
    }

    #[test]
    fn apply_claims_keeps_existing_email() {
        let mut a = account();
        a.email = Some("kept@example.com".into());
        a.apply_claims(&AccountClaims {
            email: Some("claims@example.com".into()),
            account_id: Some("acct".into()),
            user_id: Some("user".into()),
            plan_type: Some("plus".into()),
            expires_at: None,
        });
        assert_eq!(a.email.as_deref(), Some("kept@example.com"));
        assert_eq!(a.account_id.as_deref(), Some("acct"));
        assert_eq!(a.plan_type.as_deref(), Some("plus"));
    }

    #[test]
    fn snapshot_uses_camel_case_and_skips_transient_fields() {
        let mut a = account();
        a.is_refreshing = true;
        a.global_rate_limit_reset = Some(9);
        let snapshot = PoolSnapshot {
            version: POOL_FORMAT_VERSION,
            accounts: vec![a],
            active_account_index: 0,
        };
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["version"], 1);
        assert_eq!(json["activeAccountIndex"], 0);
        let stored = &json["accounts"][0];
        assert_eq!(stored["refreshToken"], "rt_1");
        assert_eq!(stored["globalRateLimitReset"], 9);
        assert!(stored.get("isRefreshing").is_none());
        assert!(stored.get("handle").is_none());
    }

    #[test]
    fn label_prefers_email_then_account_id() {
        let mut a = account();
        assert_eq!(a.label(), "account 1");
        a.account_id = Some("acct-7".into());
        assert_eq!(a.label(), "acct-7");
        a.email = Some("me@example.com".into());
        assert_eq!(a.label(), "me@example.com");
    }
}
