//! Usage snapshot model and its two sources
//!
//! A snapshot holds the primary (short) and secondary (long) rate-limit
//! windows plus credits. Updates are partial: a field absent from an update
//! keeps its previous value. Updates come either from `x-codex-*` response
//! headers or from the backend usage endpoint's JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use upstream::HeaderMap;

/// Timestamps at or above this are already milliseconds.
const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

/// One rate-limit window. All fields optional so partial updates merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<u64>,
    /// Unix ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
}

impl UsageWindow {
    fn is_empty(&self) -> bool {
        self.used_percent.is_none() && self.window_minutes.is_none() && self.reset_at.is_none()
    }

    fn merge(&mut self, update: &UsageWindow) {
        if let Some(pct) = update.used_percent.filter(|p| !p.is_nan()) {
            self.used_percent = Some(pct.clamp(0.0, 100.0));
        }
        if update.window_minutes.is_some() {
            self.window_minutes = update.window_minutes;
        }
        if update.reset_at.is_some() {
            self.reset_at = update.reset_at;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_credits: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlimited: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<String>,
}

impl Credits {
    pub fn is_empty(&self) -> bool {
        self.has_credits.is_none() && self.unlimited.is_none() && self.balance.is_none()
    }

    fn merge(&mut self, update: &Credits) {
        if update.has_credits.is_some() {
            self.has_credits = update.has_credits;
        }
        if update.unlimited.is_some() {
            self.unlimited = update.unlimited;
        }
        if update.balance.is_some() {
            self.balance = update.balance.clone();
        }
    }
}

/// Stored per-account usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    #[serde(default)]
    pub primary: UsageWindow,
    #[serde(default)]
    pub secondary: UsageWindow,
    #[serde(default)]
    pub credits: Credits,
    /// Unix ms of the last applied update
    pub updated_at: u64,
}

impl UsageSnapshot {
    /// Merge `update` into this snapshot and stamp it.
    pub fn apply(&mut self, update: &UsageUpdate, now: u64) {
        self.primary.merge(&update.primary);
        self.secondary.merge(&update.secondary);
        self.credits.merge(&update.credits);
        self.updated_at = now;
    }
}

/// A partial snapshot parsed from one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageUpdate {
    pub primary: UsageWindow,
    pub secondary: UsageWindow,
    pub credits: Credits,
}

impl UsageUpdate {
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty() && self.credits.is_empty()
    }

    /// Parse the `x-codex-*` usage headers of an upstream response.
    pub fn from_headers(headers: &HeaderMap, now: u64) -> Self {
        let get = |name: &str| header_str(headers, name);

        let window = |prefix: &str| {
            let reset_at = get(format!("x-codex-{prefix}-reset-at").as_str())
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(epoch_to_millis)
                .or_else(|| {
                    get(format!("x-codex-{prefix}-reset-after-seconds").as_str())
                        .and_then(|v| v.parse::<f64>().ok())
                        .filter(|secs| *secs >= 0.0)
                        .map(|secs| {
                            let delta = (secs * 1000.0).min(u64::MAX as f64) as u64;
                            now.saturating_add(delta)
                        })
                });
            UsageWindow {
                used_percent: get(format!("x-codex-{prefix}-used-percent").as_str())
                    .and_then(|v| v.parse::<f64>().ok()),
                window_minutes: get(format!("x-codex-{prefix}-window-minutes").as_str())
                    .and_then(|v| v.parse::<i64>().ok())
                    .map(|m| m.max(0) as u64),
                reset_at,
            }
        };

        Self {
            primary: window("primary"),
            secondary: window("secondary"),
            credits: Credits {
                has_credits: get("x-codex-credits-has-credits").and_then(parse_bool),
                unlimited: get("x-codex-credits-unlimited").and_then(parse_bool),
                balance: get("x-codex-credits-balance").map(str::to_owned),
            },
        }
    }
}

/// Map the backend usage payload into an update.
///
/// Reads `rate_limit.{primary,secondary}_window.{used_percent,
/// limit_window_seconds, reset_at, reset_after_seconds}` and
/// `credits.{has_credits, unlimited, balance}`.
pub fn normalize_backend_usage(payload: &Value, now: u64) -> UsageUpdate {
    let rate_limit = payload.get("rate_limit");
    let window = |name: &str| {
        let Some(w) = rate_limit.and_then(|rl| rl.get(name)) else {
            return UsageWindow::default();
        };
        UsageWindow {
            used_percent: w.get("used_percent").and_then(Value::as_f64),
            window_minutes: w
                .get("limit_window_seconds")
                .and_then(Value::as_i64)
                .map(|secs| secs.max(0) as u64 / 60),
            reset_at: w
                .get("reset_at")
                .and_then(Value::as_f64)
                .and_then(epoch_to_millis)
                .or_else(|| {
                    w.get("reset_after_seconds")
                        .and_then(Value::as_u64)
                        .map(|secs| now.saturating_add(secs.saturating_mul(1000)))
                }),
        }
    };

    let credits = payload.get("credits");
    let balance = credits.and_then(|c| c.get("balance")).and_then(|b| match b {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    UsageUpdate {
        primary: window("primary_window"),
        secondary: window("secondary_window"),
        credits: Credits {
            has_credits: credits
                .and_then(|c| c.get("has_credits"))
                .and_then(Value::as_bool),
            unlimited: credits
                .and_then(|c| c.get("unlimited"))
                .and_then(Value::as_bool),
            balance,
        },
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Seconds-or-milliseconds epoch to milliseconds. Negative values are
/// rejected.
fn epoch_to_millis(value: f64) -> Option<u64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let value = value as u64;
    Some(if value >= MILLIS_THRESHOLD {
        value
    } else {
        value * 1000
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
