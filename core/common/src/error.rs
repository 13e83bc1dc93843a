//! Common error types for Offgrid.

use thiserror::Error;

/// Top-level error type for Offgrid operations.
///
/// A missing record, cache entry or mutation is never an error; lookups
/// return `Option` instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The durable medium cannot be opened or has become unusable.
    ///
    /// Treat as permanent for the session and degrade to memory-only mode.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A single record could not be written.
    ///
    /// Local to that record; other records in the same batch still commit.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Collection is not declared in the catalog.
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Index is not declared for the collection.
    #[error("Unknown index '{index}' on collection '{collection}'")]
    UnknownIndex { collection: String, index: String },

    /// Storage operation failed without making the medium unusable.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sync scheduling failed (e.g. the scheduler is not running).
    #[error("Sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Whether this error means the durable medium is gone for the session.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
