use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use keyring::Entry;
use tracing::warn;

use super::backend::{StorageBackend, StoredEntry};
use super::StoreError;

/// Keychain service name for console credentials
pub const SERVICE_NAME: &str = "krvirt-console";

/// OS keychain backend. Each key becomes one keychain item whose secret is
/// the JSON-encoded [`StoredEntry`].
///
/// The keychain cannot be listed, so [`entries`](StorageBackend::entries)
/// only covers keys this backend has touched.
pub struct KeyringBackend {
    service: String,
    items: Mutex<HashMap<String, Entry>>,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            items: Mutex::new(HashMap::new()),
        }
    }

    fn with_item<R>(
        &self,
        key: &str,
        f: impl FnOnce(&Entry) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if !items.contains_key(key) {
            let entry = Entry::new(&self.service, key)?;
            items.insert(key.to_string(), entry);
        }
        match items.get(key) {
            Some(entry) => f(entry),
            None => Err(StoreError::Keyring(keyring::Error::NoEntry)),
        }
    }

    fn read_item(entry: &Entry, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        match entry.get_password() {
            Ok(secret) => match serde_json::from_str(&secret) {
                Ok(stored) => Ok(Some(stored)),
                Err(e) => {
                    warn!(key = key, error = %e, "Ignoring unreadable keychain item");
                    Ok(None)
                }
            },
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for KeyringBackend {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        self.with_item(key, |entry| Self::read_item(entry, key))
    }

    fn write(&self, key: &str, stored: StoredEntry) -> Result<(), StoreError> {
        let secret = serde_json::to_string(&stored)?;
        self.with_item(key, |entry| {
            entry.set_password(&secret)?;
            Ok(())
        })
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
        for key in keys {
            self.with_item(key, |entry| match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e.into()),
            })?;
        }
        Ok(())
    }

    fn entries(&self) -> Result<BTreeMap<String, StoredEntry>, StoreError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = BTreeMap::new();
        for (key, entry) in items.iter() {
            if let Some(stored) = Self::read_item(entry, key)? {
                entries.insert(key.clone(), stored);
            }
        }
        Ok(entries)
    }
}
