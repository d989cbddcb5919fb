use thiserror::Error;

use crate::sync::transport::TransportError;

#[derive(Error, Debug)]
pub enum SyncError {
    // Bootstrap errors
    #[error("Gossip group '{0}' has no members")]
    EmptyMembership(String),

    #[error("System signal {0} is not registered")]
    UnregisteredSignal(String),

    #[error("Module '{module}' failed: {message}")]
    ModuleFailed { module: String, message: String },

    #[error("Stopped by stop channel")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),

    // Round errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage engine is not ready")]
    StorageNotReady,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Errors that abort startup and end the process.
    pub fn is_bootstrap_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::EmptyMembership(_)
                | SyncError::UnregisteredSignal(_)
                | SyncError::ModuleFailed { .. }
                | SyncError::Stopped
                | SyncError::Config(_)
        )
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(err: rocksdb::Error) -> Self {
        SyncError::Storage(err.into_string())
    }
}
