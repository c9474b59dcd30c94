//! Proactive background token refresh
//!
//! Optional periodic task that walks the pool and refreshes tokens before
//! they expire, so request-time refresh is the exception. It reuses
//! `ensure_valid_token`, which means the refresh lead, failure accounting and
//! invalid-grant removal behave exactly as on the request path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::store::AccountStore;

/// Spawn a task that runs `refresh_cycle` every `interval`.
pub fn spawn_refresh_task(
    store: Arc<AccountStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        interval_secs = interval.as_secs(),
        "background token refresh enabled"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; tokens were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&store).await;
        }
    })
}

/// Check every account once. Accounts at the failure ceiling are skipped.
/// Returns how many accounts hold a usable token afterwards.
pub async fn refresh_cycle(store: &AccountStore) -> usize {
    let mut valid = 0;
    for account in store.accounts().await {
        if account.is_failing() {
            debug!(account_index = account.index, "skipping failing account");
            continue;
        }
        if store.ensure_valid_token(account.handle).await {
            valid += 1;
        }
    }
    debug!(valid, "refresh cycle complete");
    valid
}
