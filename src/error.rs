//! Error types for the object-store database.

use thiserror::Error;

/// Main error type for engine and store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Opening or upgrading a database failed; the handle stays unusable.
    #[error("Failed to open database {name}: {source}")]
    Connection {
        name: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Store already exists: {0}")]
    StoreAlreadyExists(String),

    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Key collision or unique index violation on write.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid key range: {0}")]
    InvalidRange(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Malformed key, missing in-line key, or an invalid key path.
    #[error("Data error: {0}")]
    Data(String),

    #[error("Version error: requested {requested}, stored {stored}")]
    Version { requested: u64, stored: u64 },

    #[error("Transaction is read-only: {0}")]
    ReadOnly(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Storage directory is locked by another process")]
    Locked,

    #[error("Storage directory not initialized")]
    NotInitialized,
}

impl StoreError {
    /// Wrap an open/upgrade failure for the named database.
    pub(crate) fn connection(name: &str, source: StoreError) -> Self {
        StoreError::Connection {
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
