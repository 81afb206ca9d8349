// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management for the daemon.
//!
//! User-facing settings live in the durable store (`globalConfig`); this
//! file only covers how the daemon itself runs.

use crate::service::CoordinatorOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabmix_ipc::SOCKET_NAME;
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "daemon.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
}

/// Daemon runtime settings, read from `daemon.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Override for the socket location.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Override for where the durable storage files are kept.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Byte quota of each durable storage file.
    #[serde(default = "default_durable_quota_bytes")]
    pub durable_quota_bytes: usize,
    #[serde(default = "default_session_retention_hours")]
    pub session_retention_hours: u64,
    /// Prune origin profiles unused for this many days. Unset keeps them forever.
    #[serde(default)]
    pub profile_max_age_days: Option<u64>,
}

fn default_agent_timeout_ms() -> u64 {
    2000
}

fn default_reconcile_interval_secs() -> u64 {
    10
}

fn default_durable_quota_bytes() -> usize {
    100 * 1024
}

fn default_session_retention_hours() -> u64 {
    24
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            data_dir: None,
            agent_timeout_ms: default_agent_timeout_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            durable_quota_bytes: default_durable_quota_bytes(),
            session_retention_hours: default_session_retention_hours(),
            profile_max_age_days: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        const HOUR_MS: u64 = 60 * 60 * 1000;
        CoordinatorOptions {
            session_retention_ms: self.session_retention_hours.saturating_mul(HOUR_MS),
            profile_max_age_ms: self
                .profile_max_age_days
                .map(|days| days.saturating_mul(24 * HOUR_MS)),
        }
    }
}

/// Resolves the daemon's directories and loads its config file.
pub struct ConfigManager {
    config_dir: PathBuf,
    data_dir: PathBuf,
    runtime_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = directories::ProjectDirs::from("com", "tabmix", "tabmix")
            .ok_or(ConfigError::NoConfigDir)?;
        let runtime_dir = dirs
            .runtime_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let manager = Self {
            config_dir: dirs.config_dir().to_path_buf(),
            data_dir: dirs.data_dir().to_path_buf(),
            runtime_dir,
        };
        fs::create_dir_all(&manager.config_dir)?;
        debug!("Config directory: {:?}", manager.config_dir);
        Ok(manager)
    }

    /// Keep everything under one directory.
    pub fn with_root(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            runtime_dir: root.join("run"),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load `daemon.toml`, or defaults when it does not exist.
    pub fn load_daemon_config(&self) -> Result<DaemonConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("No daemon config found, using defaults");
            return Ok(DaemonConfig::default());
        }
        let content = fs::read_to_string(&path)?;
        let config = DaemonConfig::from_toml(&content)?;
        info!("Loaded daemon config from {:?}", path);
        Ok(config)
    }

    pub fn save_daemon_config(&self, config: &DaemonConfig) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir)?;
        let path = self.config_path();
        fs::write(&path, config.to_toml()?)?;
        debug!("Saved daemon config to {:?}", path);
        Ok(())
    }

    pub fn data_dir(&self, config: &DaemonConfig) -> PathBuf {
        config
            .data_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.clone())
    }

    pub fn socket_path(&self, config: &DaemonConfig) -> PathBuf {
        config
            .socket_path
            .clone()
            .unwrap_or_else(|| self.runtime_dir.join(SOCKET_NAME))
    }
}
