//! Error types for the deploykit crate

use crate::id::ResourceId;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the scheduler and model operations
#[derive(Error, Debug)]
pub enum Error {
    /// Structurally invalid version; nothing was applied
    #[error("version {version} rejected: {reason}")]
    VersionRejected { version: u64, reason: String },

    /// Malformed resource id text
    #[error("invalid resource id: {0}")]
    InvalidResourceId(String),

    /// Malformed resource version id text
    #[error("invalid resource version id: {0}")]
    InvalidResourceVersionId(String),

    /// Resource is not part of the managed model
    #[error("unknown resource: {0}")]
    UnknownResource(ResourceId),

    /// The model source has no such version
    #[error("unknown version: {0}")]
    UnknownVersion(u64),

    /// Operation requires a running scheduler
    #[error("scheduler is not running")]
    NotRunning,

    /// Executor failure surfaced to a caller
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// A collaborator (model source, persistence) failed
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn rejected(version: u64, reason: impl Into<String>) -> Self {
        Self::VersionRejected {
            version,
            reason: reason.into(),
        }
    }
}

/// Result type for deploykit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single executor call
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The call did not return within the configured timeout
    #[error("executor call timed out after {0:?}")]
    Timeout(Duration),

    /// The executor for the agent could not be reached or created
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    /// The call was cancelled before it produced a result
    #[error("executor call cancelled")]
    Cancelled,

    /// Handler code raised an error
    #[error("handler error: {0}")]
    Handler(String),
}

impl ExecutorError {
    /// Whether the next trigger may reasonably succeed without a model change
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}
