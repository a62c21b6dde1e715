//! Error types for clinicsync-core

use thiserror::Error;

/// Result type alias using clinicsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in clinicsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local cache error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected at the boundary: unsafe identifier, unknown table or action,
    /// missing required field. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote store could not be reached or asked us to back off.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Remote store rejected the statement.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested row or operation does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether retrying the same call later can reasonably succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }

    /// Whether the error is a boundary rejection that must never be retried.
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        let message = crate::util::sanitize(&error);
        if error.is_connect() || error.is_timeout() || error.is_request() {
            Self::RemoteUnavailable(message)
        } else {
            Self::Remote(message)
        }
    }
}
