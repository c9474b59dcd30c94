//! Durable account store
//!
//! Owns the account list and its runtime state, and persists the whole pool
//! as one `PoolSnapshot`. Saves are last-write-wins: the pool file is the unit
//! of truth, so no merge happens here (usage telemetry merges, the pool does
//! not).
//!
//! The tokio Mutex around `PoolState` is never held across network I/O. Token
//! refresh runs outside it, guarded by the per-account `is_refreshing` flag so
//! a second caller observes the cached token instead of queuing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codex_auth::{RefreshOutcome, TokenRefresher, decode_claims, read_foreign_credential};
use common::{Clock, Secret, best_effort, write_private_atomic};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountHandle, POOL_FORMAT_VERSION, PoolSnapshot};
use crate::error::{Error, Result};
use crate::selector::{SelectionPolicy, SelectorState, Strategy};

/// Refresh error text that marks a revoked grant.
const INVALID_GRANT_PATTERNS: &[&str] = &["invalid_grant", "invalid grant"];

/// Pool behaviour knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub strategy: Strategy,
    pub per_model_rate_limits: bool,
    /// Offset the starting account by `pid % pool_size`
    pub pid_offset: bool,
    pub remove_on_invalid_grant: bool,
    /// Refresh access tokens this long before they expire
    pub refresh_lead: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Hybrid,
            per_model_rate_limits: true,
            pid_offset: false,
            remove_on_invalid_grant: true,
            refresh_lead: Duration::from_secs(300),
        }
    }
}

/// Coarse readiness of one account, ignoring model scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Ready,
    RateLimited,
    Failing,
}

impl AccountState {
    fn of(account: &Account, now: u64) -> Self {
        if account.is_failing() {
            AccountState::Failing
        } else if account.global_rate_limit_reset.is_some_and(|r| r > now)
            || account.rate_limit_resets.values().any(|r| *r > now)
        {
            AccountState::RateLimited
        } else {
            AccountState::Ready
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountState::Ready => "ready",
            AccountState::RateLimited => "rate_limited",
            AccountState::Failing => "failing",
        }
    }
}

/// Pool-wide counts for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub ready: usize,
    pub rate_limited: usize,
    pub failing: usize,
}

impl PoolSummary {
    /// `healthy` when every account is ready, `degraded` when some are,
    /// `unhealthy` when none are (including an empty pool).
    pub fn health(&self) -> &'static str {
        if self.total > 0 && self.ready == self.total {
            "healthy"
        } else if self.ready > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }
}

/// One line of the account-status report.
#[derive(Debug, Clone)]
pub struct AccountStatusRow {
    pub account: Account,
    pub active: bool,
    pub state: AccountState,
}

struct PoolState {
    accounts: Vec<Account>,
    selector: SelectorState,
    next_handle: u64,
}

impl PoolState {
    fn from_snapshot(snapshot: Option<PoolSnapshot>) -> Self {
        let (mut accounts, active) = match snapshot {
            Some(s) => (s.accounts, s.active_account_index),
            None => (Vec::new(), 0),
        };
        let mut next_handle = 1;
        for (i, account) in accounts.iter_mut().enumerate() {
            account.handle = AccountHandle(next_handle);
            account.index = i;
            account.is_refreshing = false;
            next_handle += 1;
        }
        let mut selector = SelectorState::new(active);
        selector.clamp(accounts.len());
        Self {
            accounts,
            selector,
            next_handle,
        }
    }

    fn allocate_handle(&mut self) -> AccountHandle {
        let handle = AccountHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn position(&self, handle: AccountHandle) -> Option<usize> {
        self.accounts.iter().position(|a| a.handle == handle)
    }

    fn get_mut(&mut self, handle: AccountHandle) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.handle == handle)
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            version: POOL_FORMAT_VERSION,
            accounts: self.accounts.clone(),
            active_account_index: self.selector.active_index,
        }
    }
}

/// Clears `is_refreshing` when a refresh is dropped before it settles, so a
/// cancelled request cannot leave the account locked out of refreshes.
struct RefreshGuard {
    state: Arc<Mutex<PoolState>>,
    handle: AccountHandle,
    armed: bool,
}

impl RefreshGuard {
    fn new(state: &Arc<Mutex<PoolState>>, handle: AccountHandle) -> Self {
        Self {
            state: state.clone(),
            handle,
            armed: true,
        }
    }

    /// Call while holding the state lock, in the same critical section that
    /// settles the flag.
    fn disarm(mut self) {
        self.armed = false;
    }
}

fn clear_refreshing(state: &mut PoolState, handle: AccountHandle) {
    if let Some(account) = state.get_mut(handle) {
        account.is_refreshing = false;
        debug!(account_index = account.index, "abandoned refresh released");
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let handle = self.handle;
        if let Ok(mut state) = self.state.try_lock() {
            clear_refreshing(&mut state, handle);
            return;
        }
        let state = self.state.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    clear_refreshing(&mut *state.lock().await, handle);
                });
            }
            Err(_) => warn!("refresh dropped outside a runtime; flag left set"),
        }
    }
}

/// Shared, disk-backed account pool.
pub struct AccountStore {
    path: PathBuf,
    config: PoolConfig,
    clock: Clock,
    refresher: Arc<dyn TokenRefresher>,
    state: Arc<Mutex<PoolState>>,
    /// Orders concurrent saves from this process
    save_lock: Mutex<()>,
}

impl AccountStore {
    /// Load the pool from `path`.
    ///
    /// A missing file, unparseable contents or an unknown format version all
    /// yield an empty pool. Loading never fails.
    pub async fn load(
        path: PathBuf,
        config: PoolConfig,
        refresher: Arc<dyn TokenRefresher>,
        clock: Clock,
    ) -> Self {
        let state = PoolState::from_snapshot(read_snapshot(&path).await);
        info!(
            path = %path.display(),
            accounts = state.accounts.len(),
            strategy = config.strategy.as_str(),
            "account pool loaded"
        );
        Self {
            path,
            config,
            clock,
            refresher,
            state: Arc::new(Mutex::new(state)),
            save_lock: Mutex::new(()),
        }
    }

    /// Replace in-memory state with the file contents. Handles are reassigned.
    pub async fn reload(&self) {
        let fresh = PoolState::from_snapshot(read_snapshot(&self.path).await);
        let mut state = self.state.lock().await;
        let base = state.next_handle.max(fresh.next_handle);
        *state = fresh;
        // Handles stay unique across reloads so stale ones never alias.
        for account in state.accounts.iter_mut() {
            account.handle = AccountHandle(base + account.index as u64);
        }
        state.next_handle = base + state.accounts.len() as u64;
        debug!(accounts = state.accounts.len(), "account pool reloaded");
    }

    /// Write the full pool to disk (temp file + rename, mode 0600).
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let bytes = {
            let state = self.state.lock().await;
            serde_json::to_vec_pretty(&state.snapshot())
                .map_err(|e| Error::Persist(format!("serializing account pool: {e}")))?
        };
        write_private_atomic(&self.path, &bytes).await?;
        Ok(())
    }

    /// Add a new account or refresh an existing one.
    ///
    /// Claims decoded from `access_token` fill in identity fields. An existing
    /// account matches first on `(user_id, account_id)`, then on the exact
    /// refresh token. A match is treated as a recovery: its failure counter
    /// resets.
    pub async fn add_or_update_account(
        &self,
        email: Option<String>,
        refresh_token: String,
        access_token: Option<String>,
        expires_at: Option<u64>,
    ) -> Result<Account> {
        if refresh_token.trim().is_empty() {
            return Err(Error::Credential("refresh token is empty".into()));
        }

        let claims = access_token
            .as_deref()
            .and_then(|t| match decode_claims(t) {
                Ok(c) => Some(c),
                Err(e) => {
                    debug!(error = %e, "access token claims unreadable");
                    None
                }
            })
            .unwrap_or_default();
        let expires_at = expires_at.or(claims.expires_at);
        let now = self.clock.now_millis();

        let account = {
            let mut state = self.state.lock().await;
            let by_identity = match (&claims.user_id, &claims.account_id) {
                (Some(user), Some(acct)) => state.accounts.iter().position(|a| {
                    a.user_id.as_deref() == Some(user.as_str())
                        && a.account_id.as_deref() == Some(acct.as_str())
                }),
                _ => None,
            };
            let existing = by_identity.or_else(|| {
                state
                    .accounts
                    .iter()
                    .position(|a| a.refresh_token.expose() == &refresh_token)
            });

            let idx = match existing {
                Some(idx) => {
                    debug!(account_index = idx, "updating existing account");
                    idx
                }
                None => {
                    let handle = state.allocate_handle();
                    let idx = state.accounts.len();
                    state
                        .accounts
                        .push(Account::new(handle, idx, Secret::new(refresh_token.clone()), now));
                    state.selector.invalidate();
                    idx
                }
            };

            let account = &mut state.accounts[idx];
            account.refresh_token = Secret::new(refresh_token);
            if let Some(access) = access_token {
                account.access_token = Some(Secret::new(access));
            }
            if expires_at.is_some() {
                account.expires_at = expires_at;
            }
            if email.is_some() {
                account.email = email;
            }
            account.apply_claims(&claims);
            account.consecutive_failures = 0;
            account.last_refresh_error = None;
            info!(
                account_index = account.index,
                account = %account.label(),
                new = existing.is_none(),
                "account stored"
            );
            account.clone()
        };

        self.save().await?;
        Ok(account)
    }

    /// Import the OAuth login another tool keeps in `path` under
    /// `provider_key`. Returns true when a new account was added.
    pub async fn import_foreign_credential(&self, path: &Path, provider_key: &str) -> bool {
        let Some(Some(credential)) =
            best_effort("read foreign credential", read_foreign_credential(path, provider_key))
                .await
        else {
            return false;
        };

        let known = {
            let state = self.state.lock().await;
            state
                .accounts
                .iter()
                .any(|a| a.refresh_token == credential.refresh)
        };
        if known {
            debug!(provider_key, "foreign credential already in pool");
            return false;
        }

        let added = best_effort(
            "import foreign credential",
            self.add_or_update_account(
                None,
                credential.refresh.expose().clone(),
                credential.access.as_ref().map(|a| a.expose().clone()),
                credential.expires,
            ),
        )
        .await;
        added.is_some()
    }

    /// Remove an account and re-index the rest densely. Returns false when the
    /// handle is unknown.
    pub async fn remove_account(&self, handle: AccountHandle) -> Result<bool> {
        {
            let mut state = self.state.lock().await;
            let Some(pos) = state.position(handle) else {
                return Ok(false);
            };
            let removed = state.accounts.remove(pos);
            for (i, account) in state.accounts.iter_mut().enumerate() {
                account.index = i;
            }
            let len = state.accounts.len();
            state.selector.clamp(len);
            state.selector.invalidate();
            info!(
                account = %removed.label(),
                remaining = len,
                "account removed from pool"
            );
        }
        self.save().await?;
        Ok(true)
    }

    /// Record a rate limit lasting `retry_after_ms` from now. Scoped to
    /// `model` when per-model tracking is on and a model is known, otherwise
    /// global to the account.
    pub async fn mark_rate_limited(
        &self,
        handle: AccountHandle,
        retry_after_ms: u64,
        model: Option<&str>,
    ) {
        let per_model = self.config.per_model_rate_limits;
        {
            let mut state = self.state.lock().await;
            let Some(account) = state.get_mut(handle) else {
                return;
            };
            let reset = self.clock.now_millis().saturating_add(retry_after_ms);
            match model {
                Some(m) if per_model => {
                    account.rate_limit_resets.insert(m.to_string(), reset);
                }
                _ => account.global_rate_limit_reset = Some(reset),
            }
            info!(
                account_index = account.index,
                model,
                retry_after_ms,
                "account rate limited"
            );
        }
        best_effort("save account pool", self.save()).await;
    }

    /// Count a refresh failure against the account. Returns true when the
    /// failure removed the account from the pool.
    pub async fn mark_refresh_failed(&self, handle: AccountHandle, error_text: &str) -> bool {
        self.record_refresh_failure(handle, error_text, None).await
    }

    async fn record_refresh_failure(
        &self,
        handle: AccountHandle,
        error_text: &str,
        guard: Option<RefreshGuard>,
    ) -> bool {
        let invalid_grant = is_invalid_grant(error_text);
        {
            let mut state = self.state.lock().await;
            if let Some(guard) = guard {
                guard.disarm();
            }
            let Some(account) = state.get_mut(handle) else {
                return false;
            };
            account.consecutive_failures = account.consecutive_failures.saturating_add(1);
            account.is_refreshing = false;
            account.last_refresh_error = Some(error_text.to_string());
            warn!(
                account_index = account.index,
                failures = account.consecutive_failures,
                error = error_text,
                "account credential failure"
            );
        }

        if invalid_grant && self.config.remove_on_invalid_grant {
            return best_effort("remove revoked account", self.remove_account(handle))
                .await
                .unwrap_or(false);
        }
        best_effort("save account pool", self.save()).await;
        false
    }

    /// Make sure the account holds a usable access token.
    ///
    /// Returns true without I/O when the token is valid beyond the refresh
    /// lead or carries no expiry. An account with no access token at all is
    /// always refreshed. While another caller is refreshing the same account
    /// this returns whether a token is cached.
    pub async fn ensure_valid_token(&self, handle: AccountHandle) -> bool {
        let refresh_token = {
            let mut state = self.state.lock().await;
            let Some(account) = state.get_mut(handle) else {
                return false;
            };
            let lead = self.config.refresh_lead.as_millis() as u64;
            let now = self.clock.now_millis();
            let needs_refresh = match (&account.access_token, account.expires_at) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(_), Some(expires)) => expires <= now.saturating_add(lead),
            };
            if !needs_refresh {
                return true;
            }
            if account.is_refreshing {
                return account.access_token.is_some();
            }
            account.is_refreshing = true;
            debug!(account_index = account.index, "refreshing access token");
            account.refresh_token.clone()
        };
        let guard = RefreshGuard::new(&self.state, handle);

        match self.refresher.refresh(refresh_token.expose()).await {
            RefreshOutcome::Success(tokens) => {
                metrics::counter!("account_pool_token_refresh_total", "outcome" => "success")
                    .increment(1);
                let claims = decode_claims(tokens.access.expose()).ok();
                {
                    let mut state = self.state.lock().await;
                    guard.disarm();
                    let Some(account) = state.get_mut(handle) else {
                        return false;
                    };
                    account.access_token = Some(tokens.access);
                    account.refresh_token = tokens.refresh;
                    account.expires_at = Some(tokens.expires);
                    if let Some(claims) = &claims {
                        account.apply_claims(claims);
                    }
                    account.consecutive_failures = 0;
                    account.last_refresh_error = None;
                    account.is_refreshing = false;
                    info!(account_index = account.index, "access token refreshed");
                }
                best_effort("save account pool", self.save()).await;
                true
            }
            RefreshOutcome::Failed { reason } => {
                metrics::counter!("account_pool_token_refresh_total", "outcome" => "failure")
                    .increment(1);
                self.record_refresh_failure(handle, &reason, Some(guard))
                    .await;
                false
            }
        }
    }

    pub async fn select_account(&self, model: Option<&str>) -> Option<Account> {
        self.select_account_excluding(model, &[]).await
    }

    /// Select an account for `model`, never returning one of `exclude`.
    pub async fn select_account_excluding(
        &self,
        model: Option<&str>,
        exclude: &[AccountHandle],
    ) -> Option<Account> {
        let policy = self.policy();
        let now = self.clock.now_millis();
        let (account, persist) = {
            let mut state = self.state.lock().await;
            let PoolState {
                accounts, selector, ..
            } = &mut *state;
            let selection = selector.select(accounts, &policy, model, exclude, now)?;
            debug!(
                account_index = selection.index,
                fallback = selection.fallback,
                model,
                "account selected"
            );
            (accounts[selection.index].clone(), selection.persist_active)
        };
        if persist {
            best_effort("save account pool", self.save()).await;
        }
        Some(account)
    }

    /// The account's ChatGPT account id, decoding and caching it from the
    /// access token when not yet known.
    pub async fn resolve_account_id(&self, handle: AccountHandle) -> Option<String> {
        let resolved = {
            let mut state = self.state.lock().await;
            let account = state.get_mut(handle)?;
            if let Some(id) = &account.account_id {
                return Some(id.clone());
            }
            let claims = decode_claims(account.access_token.as_ref()?.expose()).ok()?;
            account.apply_claims(&claims);
            account.account_id.clone()
        };
        if resolved.is_some() {
            best_effort("save account pool", self.save()).await;
        }
        resolved
    }

    pub async fn account(&self, handle: AccountHandle) -> Option<Account> {
        let state = self.state.lock().await;
        state.accounts.iter().find(|a| a.handle == handle).cloned()
    }

    pub async fn account_at(&self, index: usize) -> Option<Account> {
        self.state.lock().await.accounts.get(index).cloned()
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.accounts.is_empty()
    }

    pub async fn active_index(&self) -> usize {
        self.state.lock().await.selector.active_index
    }

    pub async fn summary(&self) -> PoolSummary {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        let mut summary = PoolSummary {
            total: state.accounts.len(),
            ..PoolSummary::default()
        };
        for account in &state.accounts {
            match AccountState::of(account, now) {
                AccountState::Ready => summary.ready += 1,
                AccountState::RateLimited => summary.rate_limited += 1,
                AccountState::Failing => summary.failing += 1,
            }
        }
        summary
    }

    pub async fn status_rows(&self) -> Vec<AccountStatusRow> {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        state
            .accounts
            .iter()
            .map(|account| AccountStatusRow {
                active: account.index == state.selector.active_index,
                state: AccountState::of(account, now),
                account: account.clone(),
            })
            .collect()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            strategy: self.config.strategy,
            per_model_rate_limits: self.config.per_model_rate_limits,
            pid_offset: self.config.pid_offset.then(std::process::id),
        }
    }
}

fn is_invalid_grant(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    INVALID_GRANT_PATTERNS.iter().any(|p| lower.contains(p))
}

async fn read_snapshot(path: &Path) -> Option<PoolSnapshot> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "account pool file not found, starting empty");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "account pool unreadable, starting empty");
            return None;
        }
    };
    let snapshot: PoolSnapshot = match serde_json::from_str(&contents) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "account pool unparseable, starting empty");
            return None;
        }
    };
    if snapshot.version != POOL_FORMAT_VERSION {
        warn!(
            path = %path.display(),
            version = snapshot.version,
            "unsupported account pool version, starting empty"
        );
        return None;
    }
    Some(snapshot)
}
