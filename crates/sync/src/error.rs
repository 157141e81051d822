//! Sync client error types

use relaydesk_shared::SchemaError;
use tokio_tungstenite::tungstenite;

/// Error type for sync client operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid frame: {0}")]
    Schema(#[from] SchemaError),

    #[error("Relay connection closed")]
    Closed,

    #[error("Timeout waiting for relay")]
    Timeout,

    #[error("Invalid relay request: {0}")]
    InvalidRequest(String),

    #[error("Outbound queue full ({0} events waiting)")]
    QueueFull(usize),

    #[error("Gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),

    #[error("Sync manager has shut down")]
    ShutDown,
}

impl SyncError {
    /// Returns true if this error is transient and the connection should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            // Retry network-related errors and timeouts
            SyncError::WebSocket(_) => true,
            SyncError::Http(_) => true,
            SyncError::Closed => true,
            SyncError::Timeout => true,

            // Don't retry permanent errors
            SyncError::Schema(_) => false,
            SyncError::InvalidRequest(_) => false,
            SyncError::QueueFull(_) => false,
            SyncError::RetriesExhausted(_) => false,
            SyncError::ShutDown => false,
        }
    }
}

/// Result type for sync client operations
pub type SyncResult<T> = Result<T, SyncError>;
