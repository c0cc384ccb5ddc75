//! Domain error types
//!
//! Validation failures raised while constructing domain values.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid relative path (absolute, empty, or escaping its root)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid fingerprint format (expected lowercase SHA-256 hex)
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Unknown enum discriminant read from storage or the wire
    #[error("Unknown {what}: {value}")]
    UnknownVariant {
        /// Name of the enum being parsed
        what: &'static str,
        /// The offending value
        value: String,
    },
}
