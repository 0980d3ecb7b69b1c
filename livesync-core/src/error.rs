//! Error types for the livesync ecosystem.

use thiserror::Error;

/// Errors that can occur in livesync operations.
#[derive(Error, Debug)]
pub enum LiveSyncError {
    #[error("Channel already exists: {0}")]
    DuplicateChannel(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Registration rejected by provider: {0}")]
    Registration(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid notification: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for livesync operations.
pub type LiveSyncResult<T> = Result<T, LiveSyncError>;
