//! Client configuration.
//!
//! Loaded from `config.toml` in the platform config directory:
//! - Linux: ~/.config/sftp_rs/config.toml
//! - macOS: ~/Library/Application Support/sftp_rs/config.toml
//! - Windows: %APPDATA%\sftp_rs\config.toml
//!
//! Every field is optional; a missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::connections::errors::SftpError;
use crate::core::transfer::TransferOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub transfer: TransferOptions,
}

/// Timeouts and keepalive policy applied to every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for each connect phase (socket, handshake, auth, ...).
    pub connect_timeout_ms: u64,
    /// Deadline for single requests issued outside transfers.
    pub request_timeout_ms: u64,
    /// Idle time before a keepalive probe is sent. 0 disables keepalive.
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
    /// Consecutive unanswered probes after which the session is failed.
    pub keepalive_max_missed: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            request_timeout_ms: 30_000,
            keepalive_interval_ms: 30_000,
            keepalive_timeout_ms: 10_000,
            keepalive_max_missed: 3,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
}

impl ClientConfig {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "sftp_rs").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self, SftpError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SftpError> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&text).map_err(|e| {
            SftpError::InvalidArgument(format!("config {}: {e}", path.display()))
        })?;
        config.transfer.validate()?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }
}
