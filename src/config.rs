//! Server configuration, loaded from TOML.

use serde::{Deserialize, Serialize};

/// Top-level server config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bind address override (host:port).
    pub bind: Option<String>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// The reaper's inactivity windows.
///
/// The grace window for disconnected connections is deliberately longer
/// than the liveness timeout: a disconnected identity must survive long
/// enough for a page refresh to reclaim it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timeouts {
    /// Seconds between reaper sweeps.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    /// A live socket with no activity for this long is removed.
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// A disconnected connection is kept for this long before removal.
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_secs: u64,
}

fn default_reap_interval() -> u64 {
    60
}

fn default_liveness_timeout() -> u64 {
    180
}

fn default_disconnect_grace() -> u64 {
    300
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            reap_interval_secs: default_reap_interval(),
            liveness_timeout_secs: default_liveness_timeout(),
            disconnect_grace_secs: default_disconnect_grace(),
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(std::path::PathBuf, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(std::path::PathBuf, toml::de::Error),
}

impl Config {
    /// Load config from a TOML file path. Returns `None` if the file
    /// doesn't exist.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}
