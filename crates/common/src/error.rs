//! Error types for Weftnet

use thiserror::Error;

/// Result type alias using Weftnet Error
pub type Result<T> = std::result::Result<T, Error>;

/// Weftnet error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("No free /{prefix_len} prefix available")]
    AddressSpaceExhausted { prefix_len: u8 },

    #[error("Unknown or expired token")]
    UnknownToken,

    #[error("Unauthorized source address: {address}")]
    UnauthorizedSource { address: String },

    #[error("Invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Registry request failed: {0}")]
    Registry(String),

    #[error("Failed to spawn subprocess: {0}")]
    SubprocessSpawn(String),

    #[error("Persistent store corrupted: {0}")]
    PersistenceCorruption(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<der::Error> for Error {
    fn from(e: der::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<pkcs8::Error> for Error {
    fn from(e: pkcs8::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<pem::PemError> for Error {
    fn from(e: pem::PemError) -> Self {
        Error::Crypto(e.to_string())
    }
}
