//! Debounced operator notices
//!
//! Account switches and pool exhaustion are worth telling the user about, but
//! not once per request during a burst. Notices are `info!` events on the
//! `notice` target; each board remembers when it last spoke and stays quiet
//! for the debounce window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Clock;
use tracing::info;

const NEVER: u64 = u64::MAX;

#[derive(Debug)]
pub struct NoticeBoard {
    debounce: Duration,
    clock: Clock,
    last_shown: AtomicU64,
}

impl NoticeBoard {
    pub fn new(debounce: Duration, clock: Clock) -> Self {
        Self {
            debounce,
            clock,
            last_shown: AtomicU64::new(NEVER),
        }
    }

    /// Emit `message` unless another notice went out within the debounce
    /// window. Returns whether it was emitted.
    pub fn notify(&self, message: &str) -> bool {
        let now = self.clock.now_millis();
        let window = self.debounce.as_millis() as u64;
        let last = self.last_shown.load(Ordering::SeqCst);
        if last != NEVER && now.saturating_sub(last) < window {
            return false;
        }
        if self
            .last_shown
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        info!(target: "notice", "{message}");
        true
    }

    pub fn account_switched(&self, label: &str) -> bool {
        self.notify(&format!("Switched to account {label}"))
    }

    pub fn all_rate_limited(&self, retry_after_ms: u64) -> bool {
        let secs = retry_after_ms.div_ceil(1000);
        self.notify(&format!(
            "All accounts are rate limited; earliest retry in {secs}s"
        ))
    }
}
