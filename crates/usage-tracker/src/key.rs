//! Pool-independent snapshot keys
//!
//! Pool indices shift on removal, so usage is keyed by account identity. In
//! order of preference: `acct:{account_id}:{email}:{plan}`, then
//! `rt:{sha256(refresh token) prefix}`, then `email:{email}`.

use std::fmt;

use account_pool::Account;
use sha2::{Digest, Sha256};

/// Hex characters of the refresh-token digest kept in the key.
const TOKEN_DIGEST_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey(String);

impl UsageKey {
    pub fn for_account(account: &Account) -> Option<Self> {
        if let Some(account_id) = &account.account_id {
            return Some(Self(format!(
                "acct:{account_id}:{}:{}",
                account.email.as_deref().unwrap_or(""),
                account.plan_type.as_deref().unwrap_or(""),
            )));
        }

        let refresh = account.refresh_token.expose();
        if !refresh.is_empty() {
            let digest = Sha256::digest(refresh.as_bytes());
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            return Some(Self(format!("rt:{}", &hex[..TOKEN_DIGEST_LEN])));
        }

        account.email.as_ref().map(|email| Self(format!("email:{email}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UsageKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::PoolSnapshot;

    fn account(json: serde_json::Value) -> Account {
        let snapshot: PoolSnapshot = serde_json::from_value(serde_json::json!({
            "version": 1,
            "accounts": [json],
        }))
        .unwrap();
        snapshot.accounts.into_iter().next().unwrap()
    }

    #[test]
    fn prefers_account_identity() {
        let a = account(serde_json::json!({
            "index": 0,
            "refreshToken": "rt",
            "accountId": "acct-1",
            "email": "dev@example.com",
            "planType": "pro",
        }));
        assert_eq!(
            UsageKey::for_account(&a).unwrap().as_str(),
            "acct:acct-1:dev@example.com:pro"
        );
    }

    #[test]
    fn falls_back_to_token_digest() {
        let a = account(serde_json::json!({
            "index": 0,
            "refreshToken": "rt_secret",
            "email": "x@y",
        }));
        let key = UsageKey::for_account(&a).unwrap();
        assert!(key.as_str().starts_with("rt:"));
        assert_eq!(key.as_str().len(), 3 + TOKEN_DIGEST_LEN);
        assert!(!key.as_str().contains("rt_secret"));

        // Stable across calls and reordering
        assert_eq!(UsageKey::for_account(&a), Some(key));
    }

    #[test]
    fn email_is_last_resort() {
        let a = account(serde_json::json!({
            "index": 3,
            "refreshToken": "",
            "email": "only@example.com",
        }));
        assert_eq!(
            UsageKey::for_account(&a).unwrap().as_str(),
            "email:only@example.com"
        );

        let bare = account(serde_json::json!({"index": 0, "refreshToken": ""}));
        assert!(UsageKey::for_account(&bare).is_none());
    }
}
