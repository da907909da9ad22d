//! Error types for the sync layer.

use thiserror::Error;

/// Errors that can occur in the realtime sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The push transport could not subscribe or deliver.
    #[error("transport error: {0}")]
    Transport(String),

    /// The push channel is closed (peer gone, socket dropped).
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Presence tracking failed.
    #[error("presence error: {0}")]
    Presence(String),

    /// A caller-supplied revert function failed during undo.
    #[error("undo of {kind} failed: {message}")]
    RevertFailed { kind: String, message: String },

    /// The scheduler has been shut down.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
