//! Error types for the HAL crate.

use thiserror::Error;

/// Errors that can occur in HAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HalError {
    /// No backend registered under this name.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// A backend descriptor failed validation at registration.
    #[error("Invalid descriptor for backend {backend}: {reason}")]
    InvalidDescriptor { backend: String, reason: String },

    /// A results payload did not have the expected shape.
    #[error("Invalid result payload: {0}")]
    InvalidResult(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for HAL operations.
pub type HalResult<T> = Result<T, HalError>;
