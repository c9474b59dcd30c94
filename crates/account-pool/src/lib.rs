//! Multi-account pool for ChatGPT OAuth identities
//!
//! Owns the durable account list, picks an account per request, and tracks
//! what upstream responses say about each account. The store is shared by
//! every process on the machine through one JSON file.
//!
//! Account lifecycle:
//! 1. Added through the admin API or imported from a foreign credential file
//! 2. Selected per request (sticky, round-robin or hybrid) while available
//! 3. 429 from upstream: rate limited for one model, or globally
//! 4. Refresh failure or 401: failure counter increments; three in a row and
//!    the account stops being selected until a successful refresh or re-add
//! 5. Revoked grant: removed from the pool (policy-gated)

pub mod account;
pub mod error;
pub mod quota;
pub mod refresh;
pub mod selector;
pub mod store;

#[cfg(test)]
mod testing;

pub use account::{Account, AccountHandle, FAILURE_THRESHOLD, POOL_FORMAT_VERSION, PoolSnapshot};
pub use error::{Error, Result};
pub use quota::{
    DEFAULT_RETRY_AFTER_MS, ResponseClass, classify_status, is_usage_limit_error, retry_after_ms,
};
pub use refresh::{refresh_cycle, spawn_refresh_task};
pub use selector::{Selection, SelectionPolicy, SelectorState, Strategy};
pub use store::{AccountState, AccountStatusRow, AccountStore, PoolConfig, PoolSummary};
