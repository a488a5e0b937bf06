//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: backend
//! base URL, where the session is persisted, and login polling timings.
//!
//! Configuration is stored at `~/.config/teamdesk/config.json`; environment
//! variables override the file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{FileSessionStore, KeyringSessionStore, SessionStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "teamdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_BASE_URL: &str = "TEAMDESK_BASE_URL";
const ENV_SESSION_BACKEND: &str = "TEAMDESK_SESSION_BACKEND";

/// Where the session credential is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    File,
    Keyring,
}

impl std::str::FromStr for SessionBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SessionBackend::File),
            "keyring" => Ok(SessionBackend::Keyring),
            other => Err(anyhow::anyhow!("Unknown session backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub session_backend: SessionBackend,
    pub request_timeout_secs: u64,
    pub qr_poll_interval_secs: u64,
    pub qr_login_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            session_backend: SessionBackend::File,
            // 30s allows for slow API responses while failing fast enough for good UX.
            request_timeout_secs: 30,
            qr_poll_interval_secs: 2,
            qr_login_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Load the config file (defaults when absent), then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = base_url;
        }
        if let Some(backend) = lookup(ENV_SESSION_BACKEND).filter(|v| !v.is_empty()) {
            self.session_backend = backend.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Build the configured session store.
    pub fn session_store(&self) -> Result<Arc<dyn SessionStore>> {
        let store: Arc<dyn SessionStore> = match self.session_backend {
            SessionBackend::File => Arc::new(FileSessionStore::new(self.cache_dir()?)),
            SessionBackend::Keyring => Arc::new(KeyringSessionStore::new()?),
        };
        Ok(store)
    }

    pub fn qr_poll_interval(&self) -> Duration {
        Duration::from_secs(self.qr_poll_interval_secs.max(1))
    }

    pub fn qr_login_timeout(&self) -> Duration {
        Duration::from_secs(self.qr_login_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"base_url":"https://admin.example.com/api"}"#).unwrap();
        assert_eq!(config.base_url, "https://admin.example.com/api");
        assert_eq!(config.session_backend, SessionBackend::File);
        assert_eq!(config.qr_poll_interval(), Duration::from_secs(2));
        assert_eq!(config.qr_login_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(|key| match key {
                ENV_BASE_URL => Some("https://staging.example.com/api".to_string()),
                ENV_SESSION_BACKEND => Some("Keyring".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.base_url, "https://staging.example.com/api");
        assert_eq!(config.session_backend, SessionBackend::Keyring);
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| {
            (key == ENV_SESSION_BACKEND).then(|| "cookie".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = Config {
            qr_poll_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.qr_poll_interval(), Duration::from_secs(1));
    }
}
