//! Disk-backed usage snapshot map
//!
//! Usage is written on nearly every response and several processes share the
//! file, so saves merge instead of overwriting: the file is re-read, each key
//! keeps whichever side has the newer `updated_at`, entries past the retention
//! window are pruned, and the result is written atomically.
//!
//! File format: a JSON array of `[key, snapshot]` pairs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use account_pool::Account;
use common::{Clock, write_private_atomic};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use upstream::HeaderMap;

use crate::error::{Error, Result};
use crate::key::UsageKey;
use crate::render::render_snapshot;
use crate::snapshot::{UsageSnapshot, UsageUpdate};

/// Staleness and retention windows.
#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub stale_after: Duration,
    pub retention: Duration,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// A stored snapshot with its computed staleness.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    #[serde(flatten)]
    pub snapshot: UsageSnapshot,
    pub is_stale: bool,
}

pub struct UsageTracker {
    path: PathBuf,
    config: UsageConfig,
    clock: Clock,
    snapshots: Mutex<HashMap<String, UsageSnapshot>>,
    save_lock: Mutex<()>,
}

impl UsageTracker {
    /// Load snapshots from `path`. Unreadable files start empty.
    pub async fn load(path: PathBuf, config: UsageConfig, clock: Clock) -> Self {
        let snapshots = read_snapshots(&path).await;
        debug!(path = %path.display(), entries = snapshots.len(), "usage snapshots loaded");
        Self {
            path,
            config,
            clock,
            snapshots: Mutex::new(snapshots),
            save_lock: Mutex::new(()),
        }
    }

    /// Merge usage headers from an upstream response. Responses without any
    /// usage header leave the snapshot (and its timestamp) untouched.
    pub async fn record_from_headers(
        &self,
        account: &Account,
        headers: &HeaderMap,
    ) -> Result<bool> {
        let update = UsageUpdate::from_headers(headers, self.clock.now_millis());
        self.record(account, &update).await
    }

    /// Merge an already-normalized backend usage response.
    pub async fn record_from_backend_query(
        &self,
        account: &Account,
        update: &UsageUpdate,
    ) -> Result<bool> {
        self.record(account, update).await
    }

    async fn record(&self, account: &Account, update: &UsageUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        let Some(key) = UsageKey::for_account(account) else {
            debug!(account_index = account.index, "account has no usage key");
            return Ok(false);
        };
        {
            let now = self.clock.now_millis();
            let mut snapshots = self.snapshots.lock().await;
            snapshots
                .entry(key.to_string())
                .or_default()
                .apply(update, now);
        }
        self.save().await?;
        Ok(true)
    }

    pub async fn get_snapshot(&self, account: &Account) -> Option<SnapshotView> {
        let key = UsageKey::for_account(account)?;
        let snapshot = self.snapshots.lock().await.get(key.as_str()).cloned()?;
        let is_stale = self.is_stale(&snapshot);
        Some(SnapshotView { snapshot, is_stale })
    }

    /// Two-bar text report for the account. Never fails; an account with no
    /// data renders as `unknown`.
    pub async fn render(&self, account: &Account) -> String {
        let view = self.get_snapshot(account).await;
        render_snapshot(
            view.as_ref().map(|v| &v.snapshot),
            view.as_ref().is_some_and(|v| v.is_stale),
            self.clock.now_millis(),
        )
    }

    /// Merge with the file, prune, and write atomically.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let on_disk = read_snapshots(&self.path).await;
        let now = self.clock.now_millis();
        let retention = self.config.retention.as_millis() as u64;

        let bytes = {
            let mut snapshots = self.snapshots.lock().await;
            for (key, disk) in on_disk {
                match snapshots.get(&key) {
                    Some(mine) if mine.updated_at >= disk.updated_at => {}
                    _ => {
                        snapshots.insert(key, disk);
                    }
                }
            }
            snapshots.retain(|_, s| now.saturating_sub(s.updated_at) <= retention);

            let mut entries: Vec<(&String, &UsageSnapshot)> = snapshots.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::to_vec_pretty(&entries)
                .map_err(|e| Error::Serialize(format!("usage snapshots: {e}")))?
        };
        write_private_atomic(&self.path, &bytes).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_stale(&self, snapshot: &UsageSnapshot) -> bool {
        let age = self.clock.now_millis().saturating_sub(snapshot.updated_at);
        age > self.config.stale_after.as_millis() as u64
    }
}

async fn read_snapshots(path: &Path) -> HashMap<String, UsageSnapshot> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "usage snapshots unreadable");
            return HashMap::new();
        }
    };
    match serde_json::from_str::<Vec<(String, UsageSnapshot)>>(&contents) {
        Ok(entries) => entries.into_iter().collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "usage snapshots unparseable");
            HashMap::new()
        }
    }
}
