//! Attempt-log-continue helper for secondary work
//!
//! Telemetry updates, foreign credential imports and state saves must never
//! fail the request that triggered them. Routing them all through one helper
//! keeps that policy in a single place.

use std::fmt::Display;
use std::future::Future;

use tracing::warn;

/// Await `fut`; on error log a warning tagged with `operation` and return
/// `None`.
pub async fn best_effort<T, E, F>(operation: &str, fut: F) -> Option<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation, error = %e, "best-effort operation failed, continuing");
            None
        }
    }
}
