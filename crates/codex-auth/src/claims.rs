//! Access token claims
//!
//! The pool never verifies signatures; it only reads identity hints out of the
//! JWT payload so accounts can be deduplicated and labelled. Decoding is a pure
//! function and fails on anything that is not a three-part base64url JWT with
//! a JSON object payload.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use crate::constants::AUTH_CLAIM_NAMESPACE;
use crate::error::{Error, Result};

/// Identity fields recovered from an access token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountClaims {
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub user_id: Option<String>,
    pub plan_type: Option<String>,
    /// `exp` converted to unix milliseconds
    pub expires_at: Option<u64>,
}

/// Decode the payload segment of `jwt` into `AccountClaims`.
pub fn decode_claims(jwt: &str) -> Result<AccountClaims> {
    let mut parts = jwt.split('.');
    let (Some(_header), Some(payload), Some(_signature)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Claims("token is not a three-part JWT".into()));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Claims(format!("payload is not base64url: {e}")))?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Claims(format!("payload is not JSON: {e}")))?;
    if !payload.is_object() {
        return Err(Error::Claims("payload is not a JSON object".into()));
    }

    let auth = payload.get(AUTH_CLAIM_NAMESPACE);
    let auth_str = |key: &str| {
        auth.and_then(|a| a.get(key))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    let email = payload
        .get("email")
        .and_then(Value::as_str)
        .or_else(|| {
            payload
                .get("https://api.openai.com/profile")
                .and_then(|p| p.get("email"))
                .and_then(Value::as_str)
        })
        .map(str::to_owned);

    Ok(AccountClaims {
        email,
        account_id: auth_str("chatgpt_account_id"),
        user_id: auth_str("chatgpt_user_id").or_else(|| auth_str("user_id")),
        plan_type: auth_str("chatgpt_plan_type"),
        expires_at: payload
            .get("exp")
            .and_then(Value::as_u64)
            .map(|secs| secs.saturating_mul(1000)),
    })
}
