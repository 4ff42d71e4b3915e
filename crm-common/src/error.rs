//! Error types for the CRM sync store

use thiserror::Error;

/// Sync-store error types
#[derive(Error, Debug)]
pub enum Error {
    // Synchronization Errors
    #[error("Transport degraded on channel {channel}: {attempts} connection attempts failed")]
    TransportDegraded { channel: String, attempts: u32 },

    #[error("Channel desynced: {channel}: {reason}")]
    ChannelDesynced { channel: String, reason: String },

    #[error("Stale event for {kind} {id}: version {incoming} <= {stored}")]
    StaleEvent {
        kind: String,
        id: String,
        incoming: u64,
        stored: u64,
    },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    // Backend Errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Snapshot fetch failed: {0}")]
    Snapshot(String),

    #[error("Snapshot rejected: {0}")]
    SnapshotRejected(String),

    // Lifecycle Errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    // General Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for sync-store operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a malformed-payload error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent(reason.into())
    }

    /// Stable error code for logs and status payloads
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransportDegraded { .. } => "transport_degraded",
            Self::ChannelDesynced { .. } => "channel_desynced",
            Self::StaleEvent { .. } => "stale_event",
            Self::MalformedEvent(_) => "malformed_event",
            Self::Transport(_) => "transport_error",
            Self::Snapshot(_) => "snapshot_error",
            Self::SnapshotRejected(_) => "snapshot_rejected",
            Self::Lifecycle(_) => "lifecycle_error",
            Self::ConfigError(_) => "config_error",
            Self::IoError(_) => "io_error",
            Self::JsonError(_) => "json_error",
        }
    }

    /// Whether the failure is recovered locally by retrying with backoff.
    ///
    /// Transient failures are never surfaced to consumers as errors; they only
    /// show up as a `stale` flag on the affected channel.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Snapshot(_) | Self::IoError(_)
        )
    }
}
