//! Account selection strategies
//!
//! Pure decision logic over the account list; no I/O. Three strategies:
//!
//! - `Sticky`: keep using the active account until it becomes unavailable.
//! - `RoundRobin`: a cursor walks the pool, one step per selection.
//! - `Hybrid`: sticky within a process, but every fresh process starts one
//!   position further along (the advanced index is persisted by the store),
//!   so concurrent sessions spread across accounts without coordinating.
//!
//! When nothing is available the selector falls back to the healthy account
//! whose rate limit lifts soonest, ties going to the lowest index.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::{Account, AccountHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Sticky,
    RoundRobin,
    #[default]
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Sticky => "sticky",
            Strategy::RoundRobin => "round-robin",
            Strategy::Hybrid => "hybrid",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sticky" => Ok(Strategy::Sticky),
            "round-robin" | "round_robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "hybrid" => Ok(Strategy::Hybrid),
            other => Err(format!(
                "unknown strategy {other:?} (expected sticky, round-robin or hybrid)"
            )),
        }
    }
}

/// Inputs that shape a selection but are not per-call.
#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub strategy: Strategy,
    pub per_model_rate_limits: bool,
    /// Process id to offset the starting index by, when enabled
    pub pid_offset: Option<u32>,
}

/// Result of one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    /// Picked by the least-bad fallback rather than the availability scan
    pub fallback: bool,
    /// The active index moved during lazy initialization and should be saved
    pub persist_active: bool,
}

/// Cursor state carried between selections.
#[derive(Debug, Clone, Default)]
pub struct SelectorState {
    pub active_index: usize,
    pub cursor: usize,
    initialized: bool,
}

impl SelectorState {
    pub fn new(active_index: usize) -> Self {
        Self {
            active_index,
            cursor: 0,
            initialized: false,
        }
    }

    /// Force lazy re-initialization on the next selection. Called whenever the
    /// pool changes shape or is reloaded.
    pub fn invalidate(&mut self) {
        self.initialized = false;
    }

    /// Bring both indices back into `0..len` (or 0 for an empty pool).
    pub fn clamp(&mut self, len: usize) {
        if len == 0 {
            self.active_index = 0;
            self.cursor = 0;
            return;
        }
        if self.active_index >= len {
            self.active_index = len - 1;
        }
        self.cursor %= len;
    }

    /// Returns true when the active index moved and must be persisted.
    fn initialize(&mut self, len: usize, policy: &SelectionPolicy) -> bool {
        self.initialized = true;
        self.clamp(len);
        if len <= 1 {
            return false;
        }

        let mut moved = false;
        if policy.strategy == Strategy::Hybrid {
            self.active_index = (self.active_index + 1) % len;
            moved = true;
        }
        if let Some(pid) = policy.pid_offset {
            let offset = pid as usize % len;
            if offset != 0 {
                self.active_index = (self.active_index + offset) % len;
                self.cursor = (self.cursor + offset) % len;
                moved = true;
            }
        }
        if moved {
            debug!(
                active_index = self.active_index,
                strategy = policy.strategy.as_str(),
                "selector initialized with new starting account"
            );
        }
        moved
    }

    /// Pick an account for `model`, skipping any handle in `exclude`.
    ///
    /// Scans at most `len` accounts from the strategy's start position and
    /// returns the first available one. Falls back to the soonest-to-reset
    /// healthy account. Returns `None` only when every account is excluded or
    /// at the failure ceiling.
    pub fn select(
        &mut self,
        accounts: &mut [Account],
        policy: &SelectionPolicy,
        model: Option<&str>,
        exclude: &[AccountHandle],
        now: u64,
    ) -> Option<Selection> {
        let len = accounts.len();
        if len == 0 {
            return None;
        }

        let persist_active = if self.initialized {
            false
        } else {
            self.initialize(len, policy)
        };

        let start = match policy.strategy {
            Strategy::RoundRobin => self.cursor % len,
            Strategy::Sticky | Strategy::Hybrid => self.active_index % len,
        };

        for offset in 0..len {
            let idx = (start + offset) % len;
            let account = &mut accounts[idx];
            account.clear_expired_limits(now);
            if exclude.contains(&account.handle) {
                continue;
            }
            if !account.is_available(model, policy.per_model_rate_limits, now) {
                continue;
            }

            self.active_index = idx;
            if policy.strategy == Strategy::RoundRobin {
                self.cursor = (idx + 1) % len;
            }
            account.last_used = Some(now);
            return Some(Selection {
                index: idx,
                fallback: false,
                persist_active,
            });
        }

        // Least-bad fallback: earliest reset among healthy accounts, lowest
        // index on ties.
        let fallback = accounts
            .iter()
            .filter(|a| !a.is_failing() && !exclude.contains(&a.handle))
            .min_by_key(|a| (a.reset_time(model, policy.per_model_rate_limits), a.index))
            .map(|a| a.index)?;

        debug!(
            index = fallback,
            model, "no account available, using soonest-to-reset fallback"
        );
        accounts[fallback].last_used = Some(now);
        Some(Selection {
            index: fallback,
            fallback: true,
            persist_active,
        })
    }
}
