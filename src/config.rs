//! Client settings.
//!
//! Settings are plain data handed to [`BatchClient`](crate::BatchClient),
//! [`LockCoordinator`](crate::LockCoordinator) and
//! [`SyncEngine`](crate::SyncEngine) at construction. They can be persisted as
//! TOML; credentials are never part of the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Settings for an LFS client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LfsConfig {
    /// Git remote URL the LFS endpoint is derived from.
    pub server_url: String,
    /// Explicit LFS endpoint, overriding the derived one.
    pub lfs_url: Option<String>,
    /// Identity used for lock ownership.
    pub user_name: String,
    /// Ref sent with batch and lock requests (e.g. "refs/heads/main").
    pub ref_name: Option<String>,
    /// Root of the working tree.
    pub repo_root: Option<PathBuf>,
    /// Maximum number of concurrent transfers.
    pub parallelism: usize,
    /// Attempts per object transfer before giving up.
    pub transfer_attempts: u32,
    /// Upper bound for the local object store, in bytes.
    pub max_cache_bytes: Option<u64>,
    /// Retry policy for API requests.
    pub retry: RetryConfig,
    /// Network timeouts.
    pub timeouts: TimeoutConfig,
}

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Network timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub read_secs: u64,
    pub write_secs: u64,
}

impl Default for LfsConfig {
    fn default() -> Self {
        LfsConfig {
            server_url: String::new(),
            lfs_url: None,
            user_name: String::new(),
            ref_name: None,
            repo_root: None,
            parallelism: 4,
            transfer_attempts: 3,
            max_cache_bytes: None,
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connect_secs: 10,
            read_secs: 60,
            write_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
}

impl LfsConfig {
    /// Create settings for a remote with defaults for everything else.
    pub fn new(server_url: &str, user_name: &str) -> Self {
        LfsConfig {
            server_url: server_url.to_string(),
            user_name: user_name.to_string(),
            ..Default::default()
        }
    }

    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: LfsConfig = toml::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.as_ref().display(), "loaded LFS settings");
        Ok(config)
    }

    /// Save settings to a TOML file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Check settings for values that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() && self.lfs_url.is_none() {
            return Err(Error::Config("server_url or lfs_url must be set".into()));
        }
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.transfer_attempts == 0 {
            return Err(Error::Config("transfer_attempts must be at least 1".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Config(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}
