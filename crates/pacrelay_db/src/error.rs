//! Error types shared by the storage and domain layers.

use thiserror::Error;

/// Relay operation result type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by the interaction ledger and the recovery queue.
#[derive(Error, Debug)]
pub enum RelayError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input, invariant violation, or illegal state transition.
    /// Never retried automatically.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Attempted mutation of a frozen record or a terminal task by an
    /// unauthorized path.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Network-shaped failure. Routed through the recovery queue, never
    /// surfaced to the caller of `begin`/`complete`.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a permission error.
    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    /// Create a transient failure.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
