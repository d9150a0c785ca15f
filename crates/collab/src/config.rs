// Collaboration timing configuration.
//
// File: `~/.docket/collab.toml`. Every field is optional; missing fields
// take the documented defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root directory for Docket local state: `~/.docket/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".docket"))
}

/// Path to the collaboration config file: `~/.docket/collab.toml`.
pub fn collab_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("collab.toml"))
}

/// Intervals, timeouts and rate caps for presence and sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollabConfig {
    /// Liveness ping period.
    pub heartbeat_interval_ms: u64,
    /// Staleness threshold; must exceed the heartbeat interval.
    pub presence_timeout_ms: u64,
    /// Stale-row sweep period; should not exceed the heartbeat interval.
    pub cleanup_interval_ms: u64,
    /// Cursor write rate cap.
    pub cursor_throttle_ms: u64,
    /// Status write rate cap.
    pub status_throttle_ms: u64,
    /// Content-sync write rate cap, applied by editor integrations.
    pub sync_debounce_ms: u64,
    /// Edit-lock time-to-live.
    pub lock_expiration_ms: u64,
    /// Delay before re-subscribing after a change-feed failure.
    pub subscription_retry_ms: u64,
    /// Conditional-write attempts before a sync-state write gives up.
    pub lock_write_attempts: u32,
    /// Log filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            presence_timeout_ms: 60_000,
            cleanup_interval_ms: 15_000,
            cursor_throttle_ms: 100,
            status_throttle_ms: 2_000,
            sync_debounce_ms: 1_000,
            lock_expiration_ms: 300_000,
            subscription_retry_ms: 5_000,
            lock_write_attempts: 5,
            log_filter: "info".into(),
        }
    }
}

impl CollabConfig {
    /// Load from `~/.docket/collab.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        collab_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load and validate a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("presence_timeout_ms", self.presence_timeout_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("cursor_throttle_ms", self.cursor_throttle_ms),
            ("status_throttle_ms", self.status_throttle_ms),
            ("lock_expiration_ms", self.lock_expiration_ms),
            ("subscription_retry_ms", self.subscription_retry_ms),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{field} must be > 0")));
        }
        if self.presence_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "presence_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.cleanup_interval_ms > self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "cleanup_interval_ms must not exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.lock_write_attempts == 0 {
            return Err(ConfigError::Invalid("lock_write_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn presence_timeout(&self) -> chrono::Duration {
        millis(self.presence_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(self.cursor_throttle_ms)
    }

    pub fn status_throttle(&self) -> Duration {
        Duration::from_millis(self.status_throttle_ms)
    }

    pub fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }

    pub fn lock_expiration(&self) -> chrono::Duration {
        millis(self.lock_expiration_ms)
    }

    pub fn subscription_retry(&self) -> Duration {
        Duration::from_millis(self.subscription_retry_ms)
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
