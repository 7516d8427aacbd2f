use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;

/// A persisted value tagged with an optional expiry, the way a cookie carries
/// its `max-age`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    pub fn new(value: impl Into<String>, max_age: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at: max_age.map(|age| Utc::now() + age),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// String-keyed persistence used by [`CredentialStore`](super::CredentialStore).
///
/// Implementations store entries exactly as given; expiry and encoding are
/// handled one layer up.
pub trait StorageBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError>;

    /// Remove every key in `keys` in a single operation. Missing keys are ignored.
    fn remove(&self, keys: &[&str]) -> Result<(), StoreError>;

    fn entries(&self) -> Result<BTreeMap<String, StoredEntry>, StoreError>;
}

/// In-process backend. Used for tests and sessions that must not outlive the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, StoredEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    fn entries(&self) -> Result<BTreeMap<String, StoredEntry>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
