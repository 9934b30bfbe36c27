//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::id::ServerId;
use crate::wire::{COMMIT_TIMEOUT_MS, LIVELOCK_REPORT_INTERVAL};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub identity: IdentityConfig,
    pub executor: ExecutorSettings,
    pub store: StoreSettings,
    pub fleet: FleetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// This peer's server id. Must be a fleet id (not 0, not a sentinel).
    pub server_id: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Consecutive aborts between livelock diagnostics.
    pub livelock_report_interval: u32,
    /// How long an initiator waits for every participant to be ready.
    pub commit_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Run the Database peer.
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Number of servers the daemon runs in-process.
    pub servers: u16,
    /// Demo work units enqueued per server.
    pub demo_units: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { server_id: 1 }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            livelock_report_interval: LIVELOCK_REPORT_INTERVAL,
            commit_timeout_ms: COMMIT_TIMEOUT_MS,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: data_dir().join("store"),
        }
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            servers: 3,
            demo_units: 4,
        }
    }
}

impl IdentityConfig {
    pub fn server_id(&self) -> ServerId {
        ServerId::new(self.server_id)
    }
}

impl ExecutorSettings {
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("server id {0} is not a fleet id")]
    InvalidServerId(u16),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.identity.server_id().is_peer() || self.identity.server_id > ServerId::MAX {
            return Err(ConfigError::InvalidServerId(self.identity.server_id));
        }
        Ok(())
    }

    /// Apply FERRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FERRY_IDENTITY__SERVER_ID") {
            if let Ok(id) = v.parse() {
                self.identity.server_id = id;
            }
        }
        if let Ok(v) = std::env::var("FERRY_EXECUTOR__LIVELOCK_REPORT_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.executor.livelock_report_interval = n;
            }
        }
        if let Ok(v) = std::env::var("FERRY_EXECUTOR__COMMIT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.executor.commit_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("FERRY_STORE__ENABLED") {
            self.store.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("FERRY_STORE__PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FERRY_FLEET__SERVERS") {
            if let Ok(n) = v.parse() {
                self.fleet.servers = n;
            }
        }
    }
}
