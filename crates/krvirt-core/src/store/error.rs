use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Encryption error: {0}")]
    Crypto(String),
}
