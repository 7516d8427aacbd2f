//! Session file backend.
//!
//! All entries live in one JSON map on disk. The file is reread on every
//! access, so a second console instance sharing the cache directory sees
//! logins and logouts made by the first one.
//!
//! With a passphrase the map is sealed with ChaCha20-Poly1305 under a key
//! derived by Argon2 from the passphrase and a per-file random salt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backend::{StorageBackend, StoredEntry};
use super::StoreError;

/// Plain session file name in the cache directory
pub const SESSION_FILE: &str = "session.json";

/// Encrypted session file name in the cache directory
pub const SEALED_SESSION_FILE: &str = "session.enc";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

type EntryMap = BTreeMap<String, StoredEntry>;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    salt: String,
    nonce: String,
    ciphertext: String,
}

struct Sealer {
    cipher: ChaCha20Poly1305,
    salt: [u8; SALT_LEN],
}

impl Sealer {
    fn derive(passphrase: &str, salt: [u8; SALT_LEN]) -> Result<Self, StoreError> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| StoreError::Crypto(format!("key derivation failed: {}", e)))?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            salt,
        })
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Envelope, StoreError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| StoreError::Crypto(format!("encryption failed: {}", e)))?;
        Ok(Envelope {
            salt: STANDARD.encode(self.salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, StoreError> {
        let nonce = STANDARD
            .decode(&envelope.nonce)
            .map_err(|e| StoreError::Crypto(format!("bad nonce encoding: {}", e)))?;
        if nonce.len() != NONCE_LEN {
            return Err(StoreError::Crypto(format!("bad nonce length {}", nonce.len())));
        }
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|e| StoreError::Crypto(format!("bad ciphertext encoding: {}", e)))?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| StoreError::Crypto("decryption failed (wrong passphrase or corrupt file)".to_string()))
    }
}

pub struct FileBackend {
    path: PathBuf,
    sealer: Option<Sealer>,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileBackend {
    /// Plain JSON session file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sealer: None,
            lock: Mutex::new(()),
        }
    }

    /// Encrypted session file at `path`. An existing file keeps its salt so
    /// the same passphrase opens it again.
    pub fn encrypted(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self, StoreError> {
        let path = path.into();
        let salt = match Self::existing_salt(&path) {
            Some(salt) => salt,
            None => {
                let mut salt = [0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                salt
            }
        };
        Ok(Self {
            path,
            sealer: Some(Sealer::derive(passphrase, salt)?),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn existing_salt(path: &Path) -> Option<[u8; SALT_LEN]> {
        let contents = std::fs::read_to_string(path).ok()?;
        let envelope: Envelope = serde_json::from_str(&contents).ok()?;
        let bytes = STANDARD.decode(envelope.salt).ok()?;
        bytes.try_into().ok()
    }

    /// Load the entry map. A missing file is an empty map; an unreadable one
    /// is logged and also treated as empty so a corrupt file never locks the
    /// user out of logging in again.
    fn load(&self) -> Result<EntryMap, StoreError> {
        if !self.path.exists() {
            return Ok(EntryMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;

        let plaintext = match &self.sealer {
            Some(sealer) => {
                let opened = serde_json::from_str::<Envelope>(&contents)
                    .map_err(StoreError::from)
                    .and_then(|envelope| sealer.open(&envelope));
                match opened {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "Failed to open sealed session file");
                        return Ok(EntryMap::new());
                    }
                }
            }
            None => contents.into_bytes(),
        };

        match serde_json::from_slice(&plaintext) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse session file");
                Ok(EntryMap::new())
            }
        }
    }

    fn save(&self, map: &EntryMap) -> Result<(), StoreError> {
        if map.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = match &self.sealer {
            Some(sealer) => serde_json::to_string(&sealer.seal(&serde_json::to_vec(map)?)?)?,
            None => serde_json::to_string_pretty(map)?,
        };

        // Write then rename so a concurrent reader never sees a half-written file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = map.len(), "Session file saved");
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        if self.sealer.is_some() {
            "encrypted-file"
        } else {
            "file"
        }
    }

    fn read(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key))
    }

    fn write(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.load()?;
        map.insert(key.to_string(), entry);
        self.save(&map)
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.load()?;
        let before = map.len();
        for key in keys {
            map.remove(*key);
        }
        if map.len() == before {
            return Ok(());
        }
        self.save(&map)
    }

    fn entries(&self) -> Result<BTreeMap<String, StoredEntry>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load()
    }
}

// ============================================================================
// Tests
// ============================================================================
