use std::io;

use satchel_core::auth::AuthError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] satchel_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Collection name cannot be empty")]
    EmptyCollection,
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record body must be a JSON object: {0}")]
    InvalidRecordBody(String),
    #[error("Record not found: {collection}/{id}")]
    RecordNotFound { collection: String, id: String },
    #[error("API key cannot be empty")]
    EmptyApiKey,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error(
        "Sync is not configured. Set SATCHEL_SUPABASE_URL and SATCHEL_SUPABASE_ANON_KEY to enable `satchel sync`."
    )]
    SyncNotConfigured,
}

impl From<AuthError> for CliError {
    fn from(error: AuthError) -> Self {
        Self::Auth(error.to_string())
    }
}
