//! Server configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/askhub/server.toml`
//! - Windows: `%APPDATA%/askhub/server.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use askhub_hub::HubConfig;
use askhub_protocol::constants::{DEFAULT_WAIT_TIMEOUT, END_USER_IDENTITY, ORCHESTRATOR_IDENTITY};
use serde::{Deserialize, Serialize};

/// Default WebSocket port.
pub const DEFAULT_PORT: u16 = 5178;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity routed as the orchestrator.
    #[serde(default = "default_orchestrator")]
    pub orchestrator_identity: String,

    /// Identity routed as the end user.
    #[serde(default = "default_end_user")]
    pub end_user_identity: String,

    /// Upper bound for every wait (participant presence, answers, listeners).
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_orchestrator() -> String {
    ORCHESTRATOR_IDENTITY.into()
}

fn default_end_user() -> String {
    END_USER_IDENTITY.into()
}

fn default_wait_timeout_secs() -> u64 {
    DEFAULT_WAIT_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            orchestrator_identity: default_orchestrator(),
            end_user_identity: default_end_user(),
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from the platform path, writing defaults on
    /// first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Routing settings for the hub.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            orchestrator_identity: self.orchestrator_identity.clone(),
            end_user_identity: self.end_user_identity.clone(),
            wait_timeout: Duration::from_secs(self.wait_timeout_secs),
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("askhub")
            .join("server.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("askhub").join("server.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/askhub/server.toml"))
    }
}
