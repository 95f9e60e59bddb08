//! Error types for the ledger crate

use thiserror::Error;

/// Errors that can occur during ledger operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode a column value
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored version no longer forms a valid model
    #[error("invalid stored version: {0}")]
    Model(#[from] deploykit::Error),
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;
