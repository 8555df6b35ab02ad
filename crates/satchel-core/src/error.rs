//! Error types for satchel-core

use thiserror::Error;

use crate::auth::AuthError;

/// Result type alias using satchel-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in satchel-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote snapshot could not be applied locally
    #[error("Malformed snapshot payload: {0}")]
    MalformedPayload(String),

    /// Remote snapshot backend rejected a request
    #[error("Remote error: {0}")]
    Remote(String),

    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Identity provider error
    #[error(transparent)]
    Auth(#[from] AuthError),
}
