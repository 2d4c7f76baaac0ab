use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] stakesync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Entity id cannot be empty")]
    EmptyEntityId,
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("No conflict recorded for {0}")]
    ConflictNotFound(String),
    #[error("A sync cycle is already running")]
    SyncInProgress,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Run `stakesync config init --server-url <URL>`, or set STAKESYNC_SERVER_URL (and STAKESYNC_API_TOKEN)."
    )]
    SyncNotConfigured,
}
