//! Error types shared across collaborator boundaries

use thiserror::Error;

/// Errors returned by a Work-Item Store, local or remote
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The record is not in a state that permits the operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Lost a compare-and-set race or a lock held by someone else
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Transport or backend failure; the call may succeed if repeated
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::InvalidState(_))
    }

    /// Whether an idempotent call that failed this way is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors returned by a blob service
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("block not found: {0}")]
    NotFound(String),

    /// Stored bytes do not hash to the requested locator
    #[error("block {0} failed checksum verification")]
    Corrupt(String),

    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    #[error("blob service unavailable: {0}")]
    Unavailable(String),
}

impl BlobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
