//! Epoch-millisecond clock
//!
//! Rate-limit resets, token expiry and usage staleness are all stored as unix
//! milliseconds. Stores take a `Clock` so tests can pin and advance time
//! without sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default)]
pub enum Clock {
    /// Wall clock.
    #[default]
    System,
    /// Shared, manually driven clock. Clones observe the same time.
    Manual(Arc<AtomicU64>),
}

impl Clock {
    pub fn manual(start_millis: u64) -> Self {
        Clock::Manual(Arc::new(AtomicU64::new(start_millis)))
    }

    /// Current time as unix milliseconds.
    pub fn now_millis(&self) -> u64 {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            Clock::Manual(now) => now.load(Ordering::SeqCst),
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(now) = self {
            now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    /// Pin a manual clock. No-op on the system clock.
    pub fn set(&self, millis: u64) {
        if let Clock::Manual(now) = self {
            now.store(millis, Ordering::SeqCst);
        }
    }
}
