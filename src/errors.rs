//! Typed error taxonomy for the board service.
//!
//! Store functions return `anyhow::Result` with context attached; domain
//! failures travel inside the `anyhow::Error` as a [`BoardError`] and are
//! recovered at the HTTP boundary with [`BoardError::find`].

use thiserror::Error;

/// Domain failures of the board registry, ticket store and field registry.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl BoardError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Find the first `BoardError` anywhere in an error's cause chain.
    pub fn find(err: &anyhow::Error) -> Option<&BoardError> {
        err.chain().find_map(|cause| cause.downcast_ref::<BoardError>())
    }
}
