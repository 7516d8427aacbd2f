//! Credential persistence.
//!
//! This module provides:
//! - `CredentialStore`: typed token/user access with expiry tagging and size accounting
//! - `StorageBackend`: the string-keyed persistence seam, with in-memory,
//!   session-file (optionally encrypted), and OS keychain implementations
//!
//! Nothing here knows about HTTP or scheduling.

pub mod backend;
pub mod cipher;
pub mod credentials;
pub mod error;
pub mod file;
pub mod keychain;

pub use backend::{MemoryBackend, StorageBackend, StoredEntry};
pub use credentials::{CredentialStore, StoreOptions, TOKEN_KEY, USER_KEY};
pub use error::StoreError;
pub use file::FileBackend;
pub use keychain::KeyringBackend;
