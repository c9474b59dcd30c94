//! Per-account usage snapshots
//!
//! Best-effort telemetry about each account's rate-limit windows, fed by
//! `x-codex-*` response headers and the backend usage endpoint. Independent of
//! the account pool file: keyed by account identity rather than pool index,
//! persisted to its own file, and merged on save so concurrent processes
//! converge.

mod error;
mod key;
mod render;
mod snapshot;
mod tracker;

pub use error::{Error, Result};
pub use key::UsageKey;
pub use render::{render_snapshot, window_label};
pub use snapshot::{Credits, UsageSnapshot, UsageUpdate, UsageWindow, normalize_backend_usage};
pub use tracker::{SnapshotView, UsageConfig, UsageTracker};
