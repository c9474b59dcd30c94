//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional; an empty file yields a proxy on
//! 127.0.0.1:8787 in front of the ChatGPT backend with a hybrid pool.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use account_pool::{PoolConfig, Strategy};
use serde::Deserialize;
use usage_tracker::UsageConfig;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub pool: PoolSettings,
    pub storage: StorageConfig,
    pub usage: UsageSettings,
    pub notices: NoticeSettings,
}

/// HTTP listener and upstream settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Admin/status API listener. Disabled when absent.
    pub admin_addr: Option<SocketAddr>,
    pub upstream_url: String,
    pub timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            admin_addr: None,
            upstream_url: codex_auth::DEFAULT_UPSTREAM_URL.to_string(),
            timeout_secs: 600,
            max_connections: 1000,
        }
    }
}

/// Account selection and credential policy
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub strategy: Strategy,
    pub per_model_rate_limits: bool,
    pub pid_offset: bool,
    pub remove_on_invalid_grant: bool,
    pub refresh_lead_secs: u64,
    /// Interval of the proactive token refresher; 0 disables it.
    pub background_refresh_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            strategy: pool.strategy,
            per_model_rate_limits: pool.per_model_rate_limits,
            pid_offset: pool.pid_offset,
            remove_on_invalid_grant: pool.remove_on_invalid_grant,
            refresh_lead_secs: pool.refresh_lead.as_secs(),
            background_refresh_secs: 0,
        }
    }
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            strategy: self.strategy,
            per_model_rate_limits: self.per_model_rate_limits,
            pid_offset: self.pid_offset,
            remove_on_invalid_grant: self.remove_on_invalid_grant,
            refresh_lead: Duration::from_secs(self.refresh_lead_secs),
        }
    }

    pub fn background_refresh(&self) -> Option<Duration> {
        (self.background_refresh_secs > 0)
            .then(|| Duration::from_secs(self.background_refresh_secs))
    }
}

/// On-disk locations
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub accounts_path: PathBuf,
    pub usage_path: PathBuf,
    /// Single-account credential file owned by another tool, imported at
    /// startup when set.
    pub foreign_credentials_path: Option<PathBuf>,
    pub foreign_provider_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            accounts_path: PathBuf::from("accounts.json"),
            usage_path: PathBuf::from("usage.json"),
            foreign_credentials_path: None,
            foreign_provider_key: codex_auth::DEFAULT_PROVIDER_KEY.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    pub stale_after_secs: u64,
    pub retention_days: u64,
}

impl Default for UsageSettings {
    fn default() -> Self {
        let usage = UsageConfig::default();
        Self {
            stale_after_secs: usage.stale_after.as_secs(),
            retention_days: usage.retention.as_secs() / 86_400,
        }
    }
}

impl UsageSettings {
    pub fn usage_config(&self) -> UsageConfig {
        UsageConfig {
            stale_after: Duration::from_secs(self.stale_after_secs),
            retention: Duration::from_secs(self.retention_days * 86_400),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NoticeSettings {
    pub debounce_secs: u64,
}

impl Default for NoticeSettings {
    fn default() -> Self {
        Self { debounce_secs: 30 }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Overrides:
    /// 1. CODEX_PROXY_ACCOUNTS_PATH replaces `storage.accounts_path`
    /// 2. CODEX_PROXY_USAGE_PATH replaces `storage.usage_path`
    /// 3. CODEX_PROXY_STRATEGY replaces `pool.strategy`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(p) = std::env::var("CODEX_PROXY_ACCOUNTS_PATH") {
            config.storage.accounts_path = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CODEX_PROXY_USAGE_PATH") {
            config.storage.usage_path = PathBuf::from(p);
        }
        if let Ok(s) = std::env::var("CODEX_PROXY_STRATEGY") {
            config.pool.strategy = s
                .parse()
                .map_err(|e: String| common::Error::Config(format!("CODEX_PROXY_STRATEGY: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.usage.stale_after_secs == 0 {
            return Err(common::Error::Config(
                "stale_after_secs must be greater than 0".into(),
            ));
        }

        if self.usage.retention_days == 0 {
            return Err(common::Error::Config(
                "retention_days must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("codex-proxy.toml")
    }

    /// Upstream base URL without a trailing slash.
    pub fn upstream_base(&self) -> &str {
        self.proxy.upstream_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OVERRIDES: &[&str] = &[
        "CODEX_PROXY_ACCOUNTS_PATH",
        "CODEX_PROXY_USAGE_PATH",
        "CODEX_PROXY_STRATEGY",
    ];

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_overrides() {
        for key in OVERRIDES {
            unsafe { remove_env(key) };
        }
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("codex-proxy.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn full_toml() -> &'static str {
        r#"
[proxy]
listen_addr = "127.0.0.1:9000"
admin_addr = "127.0.0.1:9001"
upstream_url = "https://chatgpt.com/backend-api/"
timeout_secs = 120

[pool]
strategy = "round-robin"
per_model_rate_limits = false
pid_offset = true
refresh_lead_secs = 60
background_refresh_secs = 900

[storage]
accounts_path = "/var/lib/codex/accounts.json"
usage_path = "/var/lib/codex/usage.json"
foreign_credentials_path = "/home/dev/.codex/auth.json"

[usage]
stale_after_secs = 300
retention_days = 3

[notices]
debounce_secs = 5
"#
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, full_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.listen_addr.port(), 9000);
        assert_eq!(config.proxy.admin_addr.unwrap().port(), 9001);
        assert_eq!(config.upstream_base(), "https://chatgpt.com/backend-api");
        assert_eq!(config.proxy.timeout_secs, 120);
        assert_eq!(config.proxy.max_connections, 1000);

        let pool = config.pool.pool_config();
        assert_eq!(pool.strategy, Strategy::RoundRobin);
        assert!(!pool.per_model_rate_limits);
        assert!(pool.pid_offset);
        assert!(pool.remove_on_invalid_grant);
        assert_eq!(pool.refresh_lead, Duration::from_secs(60));
        assert_eq!(
            config.pool.background_refresh(),
            Some(Duration::from_secs(900))
        );

        assert_eq!(
            config.storage.foreign_credentials_path.as_deref(),
            Some(Path::new("/home/dev/.codex/auth.json"))
        );
        assert_eq!(config.storage.foreign_provider_key, "openai");

        let usage = config.usage.usage_config();
        assert_eq!(usage.stale_after, Duration::from_secs(300));
        assert_eq!(usage.retention, Duration::from_secs(3 * 86_400));
        assert_eq!(config.notices.debounce_secs, 5);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.listen_addr, "127.0.0.1:8787".parse().unwrap());
        assert!(config.proxy.admin_addr.is_none());
        assert_eq!(config.proxy.upstream_url, "https://chatgpt.com/backend-api");
        assert_eq!(config.proxy.timeout_secs, 600);
        assert_eq!(config.pool.strategy, Strategy::Hybrid);
        assert!(config.pool.per_model_rate_limits);
        assert!(!config.pool.pid_offset);
        assert_eq!(config.pool.refresh_lead_secs, 300);
        assert!(config.pool.background_refresh().is_none());
        assert_eq!(config.storage.accounts_path, PathBuf::from("accounts.json"));
        assert_eq!(config.storage.usage_path, PathBuf::from("usage.json"));
        assert!(config.storage.foreign_credentials_path.is_none());
        assert_eq!(config.usage.stale_after_secs, 900);
        assert_eq!(config.usage.retention_days, 7);
        assert_eq!(config.notices.debounce_secs, 30);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");

        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_unknown_strategy_in_file_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[pool]\nstrategy = \"random\"\n");

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_invalid_upstream_scheme() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[proxy]\nupstream_url = \"ftp://example.com\"\n");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("upstream_url"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[proxy]\ntimeout_secs = 0\n");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[proxy]\nmax_connections = 0\n");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn test_zero_usage_windows_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();

        let path = write_config(&dir, "[usage]\nstale_after_secs = 0\n");
        assert!(Config::load(&path).is_err());

        let path = write_config(&dir, "[usage]\nretention_days = 0\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides_storage_and_strategy() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, full_toml());

        unsafe {
            set_env("CODEX_PROXY_ACCOUNTS_PATH", "/tmp/pool.json");
            set_env("CODEX_PROXY_USAGE_PATH", "/tmp/usage.json");
            set_env("CODEX_PROXY_STRATEGY", "sticky");
        }
        let config = Config::load(&path);
        clear_overrides();

        let config = config.unwrap();
        assert_eq!(config.storage.accounts_path, PathBuf::from("/tmp/pool.json"));
        assert_eq!(config.storage.usage_path, PathBuf::from("/tmp/usage.json"));
        assert_eq!(config.pool.strategy, Strategy::Sticky);
    }

    #[test]
    fn test_env_strategy_must_be_known() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        unsafe { set_env("CODEX_PROXY_STRATEGY", "least-loaded") };
        let result = Config::load(&path);
        clear_overrides();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("CODEX_PROXY_STRATEGY"));
    }

    #[test]
    fn test_resolve_path_cli_wins() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/from/env.toml") };
        let path = Config::resolve_path(Some("/from/cli.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/from/cli.toml"));
    }

    #[test]
    fn test_resolve_path_env_then_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/from/env.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/from/env.toml"));

        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("codex-proxy.toml"));
    }
}
