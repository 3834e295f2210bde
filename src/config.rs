//! Configuration loading and persistence.
//!
//! Handles reading and writing the clawker host-proxy configuration file,
//! and resolving the per-user state directory all other components build
//! their own paths from.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CALLBACK_TTL, DEFAULT_MAX_CONSECUTIVE_ERRS, DEFAULT_PORT,
    DEFAULT_WATCHER_GRACE_PERIOD, DEFAULT_WATCHER_POLL_INTERVAL, MAX_CALLBACK_TTL,
};

/// Configuration for the clawker host proxy daemon.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    /// Loopback port the Host Proxy Server binds.
    pub port: u16,
    /// Default TTL for a registered callback session, in seconds.
    pub callback_ttl_secs: u64,
    /// Upper bound a caller may raise a callback session's TTL to, in seconds.
    pub max_callback_ttl_secs: u64,
    /// Grace period before the population watcher starts polling, in
    /// milliseconds (millisecond granularity so the `S3`/`S4` scenario
    /// timings are representable in tests as well as production).
    pub watcher_grace_period_ms: u64,
    /// Interval between population watcher polls, in milliseconds.
    pub watcher_poll_interval_ms: u64,
    /// Consecutive Docker API errors before the watcher gives up.
    pub max_consecutive_errs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            callback_ttl_secs: DEFAULT_CALLBACK_TTL.as_secs(),
            max_callback_ttl_secs: MAX_CALLBACK_TTL.as_secs(),
            watcher_grace_period_ms: DEFAULT_WATCHER_GRACE_PERIOD.as_millis() as u64,
            watcher_poll_interval_ms: DEFAULT_WATCHER_POLL_INTERVAL.as_millis() as u64,
            max_consecutive_errs: DEFAULT_MAX_CONSECUTIVE_ERRS,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `CLAWKER_CONFIG_DIR` env var: explicit override
    /// 2. `CLAWKER_ENV=test` (or `cfg(test)`): `tmp/clawker-test`
    /// 3. Default: platform config dir (e.g. `~/.config/clawker`)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CLAWKER_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_any_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/clawker-test")
        } else {
            dirs::config_dir()
                .context("could not determine platform config directory")?
                .join(crate::env::APP_NAME)
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating config directory {dir:?}"))?;
        Ok(dir)
    }

    /// Directory the socket bridge manager keeps its per-container PID
    /// files under.
    pub fn bridges_dir() -> Result<PathBuf> {
        let dir = Self::config_dir()?.join("bridges");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Directory bridge subprocesses write their per-container log files
    /// under.
    pub fn bridge_logs_dir() -> Result<PathBuf> {
        let dir = Self::config_dir()?.join("logs");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Path to the host proxy daemon's PID file.
    pub fn host_proxy_pid_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("host-proxy.pid"))
    }

    /// Path to the host proxy daemon's log file.
    pub fn host_proxy_log_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("host-proxy.log"))
    }

    /// Loads configuration from file, falling back to defaults, then
    /// applying environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        let content = std::fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("CLAWKER_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("CLAWKER_POLL_INTERVAL_MS") {
            if let Ok(v) = v.parse() {
                self.watcher_poll_interval_ms = v;
            }
        }
        if let Ok(v) = std::env::var("CLAWKER_GRACE_PERIOD_MS") {
            if let Ok(v) = v.parse() {
                self.watcher_grace_period_ms = v;
            }
        }
    }

    /// Persists the current configuration to disk, mode 0600.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        std::fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn callback_ttl(&self) -> Duration {
        Duration::from_secs(self.callback_ttl_secs)
    }

    pub fn max_callback_ttl(&self) -> Duration {
        Duration::from_secs(self.max_callback_ttl_secs)
    }

    pub fn watcher_grace_period(&self) -> Duration {
        Duration::from_millis(self.watcher_grace_period_ms)
    }

    pub fn watcher_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_consecutive_errs, 10);
        assert!(config.callback_ttl_secs < config.max_callback_ttl_secs);
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = Config {
            port: 19999,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_dir_is_under_tmp_in_test_mode() {
        let dir = Config::config_dir().unwrap();
        assert!(dir.to_string_lossy().contains("clawker-test"));
    }
}
