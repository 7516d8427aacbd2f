//! Configuration management.
//!
//! Configuration is read from `~/.config/krvirt-console/config.json`, then
//! overridden by `KRVIRT_*` environment variables (a `.env` file is honoured).
//! A missing file means defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::rest::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::refresh::scheduler::DEFAULT_REFRESH_INTERVAL_SECS;
use crate::refresh::RefreshSettings;
use crate::store::credentials::DEFAULT_SIZE_LIMIT_BYTES;
use crate::store::file::{SEALED_SESSION_FILE, SESSION_FILE};
use crate::store::{CredentialStore, FileBackend, KeyringBackend, MemoryBackend, StoreOptions};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "krvirt-console";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// 7 days, the browser console's cookie lifetime.
const DEFAULT_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;

/// Where credentials are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    Memory,
    #[default]
    File,
    EncryptedFile,
    Keyring,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageKind::Memory),
            "file" => Ok(StorageKind::File),
            "encrypted-file" => Ok(StorageKind::EncryptedFile),
            "keyring" => Ok(StorageKind::Keyring),
            other => anyhow::bail!(
                "unknown storage kind '{}' (expected memory, file, encrypted-file, or keyring)",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub max_consecutive_refresh_failures: Option<u32>,
    pub token_max_age_secs: i64,
    pub user_max_age_secs: i64,
    pub size_limit_bytes: usize,
    pub storage: StorageKind,
    /// Only ever taken from the environment.
    #[serde(skip_serializing)]
    pub store_passphrase: Option<String>,
    pub obfuscation_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            max_consecutive_refresh_failures: None,
            token_max_age_secs: DEFAULT_MAX_AGE_SECS,
            user_max_age_secs: DEFAULT_MAX_AGE_SECS,
            size_limit_bytes: DEFAULT_SIZE_LIMIT_BYTES,
            storage: StorageKind::default(),
            store_passphrase: None,
            obfuscation_key: None,
        }
    }
}

impl Config {
    /// Load from the default path, then apply environment overrides.
    pub fn load() -> Result<Self> {
        // Load .env file if present (silently ignore if not found)
        let _ = dotenvy::dotenv();
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load from `path` without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
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

    /// Apply `KRVIRT_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: FromStr>(name: &str, value: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {}={}: {}", name, value, e))
        }

        if let Some(url) = lookup("KRVIRT_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(value) = lookup("KRVIRT_REFRESH_INTERVAL_SECS") {
            self.refresh_interval_secs = parsed("KRVIRT_REFRESH_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = lookup("KRVIRT_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parsed("KRVIRT_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("KRVIRT_MAX_REFRESH_FAILURES") {
            // 0 turns escalation off.
            let limit: u32 = parsed("KRVIRT_MAX_REFRESH_FAILURES", &value)?;
            self.max_consecutive_refresh_failures = (limit > 0).then_some(limit);
        }
        if let Some(value) = lookup("KRVIRT_STORAGE") {
            self.storage = value.parse().context("Invalid KRVIRT_STORAGE")?;
        }
        if let Some(passphrase) = lookup("KRVIRT_STORE_PASSPHRASE") {
            self.store_passphrase = Some(passphrase);
        }
        if let Some(key) = lookup("KRVIRT_OBFUSCATION_KEY") {
            self.obfuscation_key = Some(key);
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

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            interval: Duration::from_secs(self.refresh_interval_secs.max(1)),
            max_consecutive_failures: self.max_consecutive_refresh_failures,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            token_max_age: Some(chrono::Duration::seconds(self.token_max_age_secs)),
            user_max_age: Some(chrono::Duration::seconds(self.user_max_age_secs)),
            size_limit: self.size_limit_bytes,
            obfuscation_key: self.obfuscation_key.clone(),
        }
    }

    /// Build the credential store this configuration names.
    pub fn open_store(&self) -> Result<CredentialStore> {
        self.open_store_in(&self.cache_dir()?)
    }

    /// Like [`Config::open_store`], with session files placed in `dir`.
    pub fn open_store_in(&self, dir: &Path) -> Result<CredentialStore> {
        let store = match self.storage {
            StorageKind::Memory => CredentialStore::new(Arc::new(MemoryBackend::new())),
            StorageKind::File => CredentialStore::new(Arc::new(FileBackend::new(dir.join(SESSION_FILE)))),
            StorageKind::EncryptedFile => {
                let passphrase = self
                    .store_passphrase
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .context("encrypted-file storage requires KRVIRT_STORE_PASSPHRASE")?;
                let backend = FileBackend::encrypted(dir.join(SEALED_SESSION_FILE), passphrase)
                    .context("Failed to open encrypted session file")?;
                CredentialStore::new(Arc::new(backend))
            }
            StorageKind::Keyring => CredentialStore::new(Arc::new(KeyringBackend::new())),
        };
        debug!(backend = store.backend_name(), "Credential store opened");
        Ok(store.with_options(self.store_options()))
    }
}
