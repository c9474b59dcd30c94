//! Upstream response classification
//!
//! Decides what a non-2xx upstream response means for the account that sent
//! it, and how long a rate limit lasts. The orchestrator owns the branching;
//! this module only reads statuses, headers and bodies.

use serde_json::Value;

/// Rate-limit duration when the upstream gives no hint.
pub const DEFAULT_RETRY_AFTER_MS: u64 = 60_000;

/// Timestamps at or above this are already milliseconds.
const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

/// Error codes and phrases that mark a plan usage limit.
const USAGE_LIMIT_PATTERNS: &[&str] = &[
    "usage_limit_reached",
    "usage_not_included",
    "rate_limit_exceeded",
    "usage limit",
];

/// How the orchestrator should treat an upstream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    RateLimited,
    Unauthorized,
    Failed,
}

pub fn classify_status(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        429 => ResponseClass::RateLimited,
        401 => ResponseClass::Unauthorized,
        _ => ResponseClass::Failed,
    }
}

/// Whether an error body describes a plan usage limit.
pub fn is_usage_limit_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    USAGE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Milliseconds until a rate-limited account may be used again.
///
/// Order of precedence: `Retry-After` in seconds, then an absolute reset time
/// in the body (`error.resets_at` or `resets_at`, seconds or milliseconds),
/// then a relative `error.resets_in_seconds`, then `DEFAULT_RETRY_AFTER_MS`.
pub fn retry_after_ms(retry_after: Option<&str>, body: &str, now_ms: u64) -> u64 {
    if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
        return secs.saturating_mul(1000);
    }
    body_reset_ms(body, now_ms).unwrap_or(DEFAULT_RETRY_AFTER_MS)
}

fn body_reset_ms(body: &str, now_ms: u64) -> Option<u64> {
    let json: Value = serde_json::from_str(body).ok()?;
    let error = json.get("error");

    let resets_at = error
        .and_then(|e| e.get("resets_at"))
        .or_else(|| json.get("resets_at"))
        .and_then(Value::as_u64);
    if let Some(at) = resets_at {
        let at_ms = if at >= MILLIS_THRESHOLD { at } else { at * 1000 };
        return Some(at_ms.saturating_sub(now_ms));
    }

    error
        .and_then(|e| e.get("resets_in_seconds"))
        .and_then(Value::as_u64)
        .map(|secs| secs.saturating_mul(1000))
}
