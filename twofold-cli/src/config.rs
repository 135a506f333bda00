//! Client configuration (`twofold.toml`).

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use twofold_core::{get_default_config_path, get_default_store_path};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub database_path: PathBuf,
    /// Relay serving the reference clock and the rendezvous registry.
    pub relay_url: Option<String>,
    pub clock_refresh_secs: u64,
    pub tick_millis: u64,
    pub time_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database_path: get_default_store_path(),
            relay_url: None,
            clock_refresh_secs: 3600,
            tick_millis: 200,
            time_timeout_secs: 5,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml_dep::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load `explicit` if given (it must exist), otherwise the platform
    /// default file when present, otherwise defaults.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = get_default_config_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    tracing::debug!("No config at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn require_relay(&self) -> anyhow::Result<&str> {
        self.relay_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No relay configured; pass --relay or set relay_url"))
    }

    pub fn clock_refresh(&self) -> Duration {
        Duration::from_secs(self.clock_refresh_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(10))
    }

    pub fn time_timeout(&self) -> Duration {
        Duration::from_secs(self.time_timeout_secs.max(1))
    }
}
