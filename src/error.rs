//! Error types for the reactive store.

use thiserror::Error;

/// Main error type for store operations.
///
/// `Clone` so a single failure can be handed to every caller sharing an
/// in-flight operation.
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    /// A key that must be a collection member does not have the expected shape.
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Storage rejected a write because the data cannot be persisted.
    #[error("Non-serializable value for key {key}: {reason}")]
    NonSerializableValue { key: String, reason: String },

    /// Storage is out of space.
    #[error("Storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    /// Storage failed to read a value.
    #[error("Storage read failure: {0}")]
    StorageReadFailure(String),

    /// Any other backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoreError {
    /// Errors caused by the shape of the data. Retrying can never succeed.
    pub fn is_fatal_write_error(&self) -> bool {
        matches!(self, StoreError::NonSerializableValue { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
