//! Error types for Multi-API

use thiserror::Error;

/// Main error type for Multi-API operations
#[derive(Error, Debug)]
pub enum MultiApiError {
    /// Registry store errors (reading or writing db.json)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Lookup of an unknown provider id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy/HTTP errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Debug trace errors
    #[error(transparent)]
    Trace(#[from] crate::trace::TraceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MultiApiError {
    fn from(e: serde_json::Error) -> Self {
        MultiApiError::Serialization(e.to_string())
    }
}

/// Result type alias for Multi-API operations
pub type Result<T> = std::result::Result<T, MultiApiError>;
