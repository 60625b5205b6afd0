//! Error types for vmstore
//!
//! Provides a unified error type for all operations. The variants follow the
//! failure classes callers have to tell apart:
//! - precondition violations are rejected before any I/O happens
//! - storage faults (I/O, corruption) mean the triggering operation did not
//!   complete and nothing it promised can be assumed
//! - shutdown timeouts are fatal and must never be swallowed

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for vmstore operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Precondition violation: {0}")]
    PreconditionViolation(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Shutdown timed out: {0}")]
    ShutdownTimeout(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Shorthand for building a precondition violation
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        StoreError::PreconditionViolation(msg.into())
    }

    /// True if the caller passed something invalid (no I/O was attempted)
    pub fn is_precondition_violation(&self) -> bool {
        matches!(self, StoreError::PreconditionViolation(_))
    }

    /// True if the error came from the storage layer itself
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Storage(_) | StoreError::Corruption(_)
        )
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
