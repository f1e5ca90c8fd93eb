/// Error types for the conversation sync engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed metadata: {0}")]
    Metadata(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

impl SyncError {
    /// Transient failures are worth surfacing to the user as "try again".
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Fetch(_) | SyncError::Timeout(_))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for SyncError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        SyncError::Engine("engine dropped the reply".to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
