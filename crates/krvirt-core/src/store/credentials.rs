use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::backend::{MemoryBackend, StorageBackend, StoredEntry};
use super::cipher;
use super::StoreError;

/// Storage key for the bearer token
pub const TOKEN_KEY: &str = "token";

/// Storage key for the JSON-encoded user info
pub const USER_KEY: &str = "user";

/// Browsers cap a cookie at roughly 4KB.
pub const DEFAULT_SIZE_LIMIT_BYTES: usize = 4096;

/// Token and user entries live for 7 days unless renewed.
const DEFAULT_MAX_AGE_DAYS: i64 = 7;

/// Fraction of the size limit above which `is_near_size_limit` reports true.
const SIZE_WARNING_RATIO: f64 = 0.8;

// Characters `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub token_max_age: Option<Duration>,
    pub user_max_age: Option<Duration>,
    pub size_limit: usize,
    /// When set, values are obfuscated with [`cipher::obfuscate`] before they
    /// reach the backend.
    pub obfuscation_key: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            token_max_age: Some(Duration::days(DEFAULT_MAX_AGE_DAYS)),
            user_max_age: Some(Duration::days(DEFAULT_MAX_AGE_DAYS)),
            size_limit: DEFAULT_SIZE_LIMIT_BYTES,
            obfuscation_key: None,
        }
    }
}

/// Typed access to the persisted token and user info.
///
/// Cloning is cheap; clones share the same backend.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
    options: StoreOptions,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .finish()
    }
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            options: StoreOptions::default(),
        }
    }

    /// Store backed by process memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn encode(&self, value: &str) -> String {
        match &self.options.obfuscation_key {
            Some(key) => cipher::obfuscate(value, key),
            None => value.to_string(),
        }
    }

    fn decode(&self, key: &str, raw: String) -> Option<String> {
        match &self.options.obfuscation_key {
            Some(secret) => {
                let decoded = cipher::deobfuscate(&raw, secret);
                if decoded.is_none() {
                    warn!(key = key, "Stored value could not be de-obfuscated");
                }
                decoded
            }
            None => Some(raw),
        }
    }

    // ===== Generic Accessors =====

    /// Write `value` under `key`, expiring after `max_age`.
    pub fn set(&self, key: &str, value: &str, max_age: Option<Duration>) -> Result<(), StoreError> {
        self.backend
            .write(key, StoredEntry::new(self.encode(value), max_age))?;

        let size = self.cookie_size();
        if size > self.options.size_limit {
            warn!(key = key, size = size, limit = self.options.size_limit, "Stored credentials exceed size limit");
        } else if self.is_near_size_limit() {
            debug!(key = key, size = size, limit = self.options.size_limit, "Stored credentials approaching size limit");
        }
        Ok(())
    }

    /// Write a value that expires after `expiry_minutes`.
    pub fn set_with_expiry(&self, key: &str, value: &str, expiry_minutes: i64) -> Result<(), StoreError> {
        self.set(key, value, Some(Duration::minutes(expiry_minutes)))
    }

    /// Read `key`. Missing, expired, and unreadable entries are all `None`.
    pub fn get(&self, key: &str) -> Option<String> {
        let entry = match self.backend.read(key) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = key, backend = self.backend.name(), error = %e, "Failed to read stored value");
                return None;
            }
        };

        if entry.is_expired() {
            debug!(key = key, "Stored value expired, purging");
            if let Err(e) = self.backend.remove(&[key]) {
                warn!(key = key, error = %e, "Failed to purge expired value");
            }
            return None;
        }

        self.decode(key, entry.value)
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(&[key])
    }

    // ===== Token =====

    /// Persist the token. Overwrites unconditionally, including with an empty
    /// string; callers validate before storing.
    pub fn set_token(&self, token: &str) -> Result<(), StoreError> {
        self.set(TOKEN_KEY, token, self.options.token_max_age)
    }

    pub fn token(&self) -> Option<String> {
        self.get(TOKEN_KEY)
    }

    pub fn remove_token(&self) -> Result<(), StoreError> {
        self.remove(TOKEN_KEY)
    }

    /// Presence check only. Real expiry is enforced by the server.
    pub fn is_token_expired(&self) -> bool {
        self.token().is_none()
    }

    // ===== User =====

    /// Persist user info as JSON. Serialization failures are returned, never
    /// swallowed.
    pub fn set_user<T: Serialize>(&self, user: &T) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(user)?;
        self.set(USER_KEY, &encoded, self.options.user_max_age)
    }

    /// Read user info. Corrupt or non-JSON values read as `None`.
    pub fn user<T: DeserializeOwned>(&self) -> Option<T> {
        let encoded = self.get(USER_KEY)?;
        match serde_json::from_str(&encoded) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Stored user info is not valid JSON");
                None
            }
        }
    }

    pub fn remove_user(&self) -> Result<(), StoreError> {
        self.remove(USER_KEY)
    }

    /// Remove token and user together.
    pub fn clear_auth(&self) -> Result<(), StoreError> {
        self.backend.remove(&[TOKEN_KEY, USER_KEY])?;
        debug!(backend = self.backend.name(), "Cleared stored credentials");
        Ok(())
    }

    // ===== Diagnostics =====

    /// Byte size of the stored values rendered as a `Cookie` header.
    pub fn cookie_size(&self) -> usize {
        let entries = match self.backend.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list stored values");
                return 0;
            }
        };
        entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, entry)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(key, COMPONENT),
                    utf8_percent_encode(&entry.value, COMPONENT)
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
            .len()
    }

    pub fn is_near_size_limit(&self) -> bool {
        self.cookie_size() as f64 > self.options.size_limit as f64 * SIZE_WARNING_RATIO
    }

    /// Every live key/value pair, decoded.
    pub fn all(&self) -> BTreeMap<String, String> {
        let entries = match self.backend.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list stored values");
                return BTreeMap::new();
            }
        };
        entries
            .into_iter()
            .filter(|(_, entry)| !entry.is_expired())
            .filter_map(|(key, entry)| {
                let value = self.decode(&key, entry.value)?;
                Some((key, value))
            })
            .collect()
    }

    /// Log a one-line summary of stored state. Never logs values.
    pub fn log_diagnostics(&self) {
        let keys: Vec<String> = self.all().into_keys().collect();
        debug!(
            backend = self.backend.name(),
            keys = ?keys,
            has_token = self.token().is_some(),
            has_user = self.get(USER_KEY).is_some(),
            size = self.cookie_size(),
            near_limit = self.is_near_size_limit(),
            "Credential store diagnostics"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
