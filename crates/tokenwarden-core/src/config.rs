//! Application configuration management.
//!
//! This module handles loading and saving the configuration: the API
//! endpoint, refresh timing, the session storage backend, and the last email
//! used to log in. Environment variables override the file.
//!
//! Configuration is stored at `~/.config/tokenwarden/config.json`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::REQUEST_TIMEOUT_SECS;
use crate::auth::session::{
    SessionConfig, DEFAULT_REFRESH_LEAD_SECS, DEFAULT_REFRESH_TIMEOUT_SECS, DEFAULT_SAFETY_BUFFER_MS,
};
use crate::storage::{EncryptedFileStorage, FileStorage, KeyringStorage, SessionStorage};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tokenwarden";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_URL: &str = "http://localhost:3000/api";

/// Upper bounds for the timing settings (one day, one hour)
const MAX_REFRESH_LEAD_SECS: u64 = 86_400;
const MAX_SAFETY_BUFFER_MS: u64 = 3_600_000;

const ENV_API_URL: &str = "TOKENWARDEN_API_URL";
const ENV_REFRESH_LEAD_SECS: &str = "TOKENWARDEN_REFRESH_LEAD_SECS";
const ENV_SAFETY_BUFFER_MS: &str = "TOKENWARDEN_SAFETY_BUFFER_MS";
const ENV_STORAGE: &str = "TOKENWARDEN_STORAGE";
const ENV_PASSPHRASE: &str = "TOKENWARDEN_PASSPHRASE";

/// Where the session snapshot is kept between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Encrypted,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "keyring" => Ok(StorageBackend::Keyring),
            "encrypted" => Ok(StorageBackend::Encrypted),
            other => anyhow::bail!("Unknown storage backend '{}' (expected file, keyring or encrypted)", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub refresh_lead_secs: u64,
    pub safety_buffer_ms: u64,
    pub refresh_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub storage: StorageBackend,
    pub last_email: Option<String>,
    /// Only ever read from the environment
    #[serde(skip)]
    pub passphrase: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            refresh_lead_secs: DEFAULT_REFRESH_LEAD_SECS,
            safety_buffer_ms: DEFAULT_SAFETY_BUFFER_MS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            storage: StorageBackend::default(),
            last_email: None,
            passphrase: None,
        }
    }
}

impl Config {
    /// Load the config file (if any), then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Self = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config
                .validate()
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Overlay values from `lookup` (the process environment in production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(secs) = lookup(ENV_REFRESH_LEAD_SECS) {
            self.refresh_lead_secs = secs
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_REFRESH_LEAD_SECS, secs))?;
        }
        if let Some(ms) = lookup(ENV_SAFETY_BUFFER_MS) {
            self.safety_buffer_ms = ms
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_SAFETY_BUFFER_MS, ms))?;
        }
        if let Some(storage) = lookup(ENV_STORAGE) {
            self.storage = storage.parse()?;
        }
        if let Some(passphrase) = lookup(ENV_PASSPHRASE) {
            self.passphrase = Some(passphrase);
        }
        self.validate()
    }

    /// Reject timing values outside the supported range
    pub fn validate(&self) -> Result<()> {
        if self.refresh_lead_secs > MAX_REFRESH_LEAD_SECS {
            anyhow::bail!(
                "refresh_lead_secs must be at most {} (got {})",
                MAX_REFRESH_LEAD_SECS,
                self.refresh_lead_secs
            );
        }
        if self.safety_buffer_ms > MAX_SAFETY_BUFFER_MS {
            anyhow::bail!(
                "safety_buffer_ms must be at most {} (got {})",
                MAX_SAFETY_BUFFER_MS,
                self.safety_buffer_ms
            );
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

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            safety_buffer: Duration::from_millis(self.safety_buffer_ms),
            refresh_lead: Duration::from_secs(self.refresh_lead_secs),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the configured storage backend under the default cache directory
    pub fn open_storage(&self) -> Result<Box<dyn SessionStorage>> {
        self.open_storage_in(&self.cache_dir()?)
    }

    pub fn open_storage_in(&self, cache_dir: &Path) -> Result<Box<dyn SessionStorage>> {
        let storage: Box<dyn SessionStorage> = match self.storage {
            StorageBackend::File => Box::new(FileStorage::in_dir(cache_dir)),
            StorageBackend::Keyring => Box::new(KeyringStorage::new(self.api_base_url.clone())),
            StorageBackend::Encrypted => {
                let passphrase = self
                    .passphrase
                    .clone()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("Encrypted storage requires {} to be set", ENV_PASSPHRASE))?;
                Box::new(EncryptedFileStorage::in_dir(cache_dir, passphrase))
            }
        };
        Ok(storage)
    }
}
