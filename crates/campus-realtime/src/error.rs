//! Error types for the Realtime client.

use campus_sync::SyncError;
use thiserror::Error;

/// Errors that can occur when talking to a Realtime server.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// WebSocket connect, read or write failed.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame or payload did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No socket is currently open.
    #[error("not connected")]
    NotConnected,

    /// The endpoint URL is unusable.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<RealtimeError> for SyncError {
    fn from(e: RealtimeError) -> Self {
        match e {
            RealtimeError::NotConnected => {
                SyncError::ChannelClosed("realtime socket not connected".to_string())
            }
            RealtimeError::Json(inner) => SyncError::Json(inner),
            other => SyncError::Transport(other.to_string()),
        }
    }
}
