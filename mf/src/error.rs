//! Fabric error types

use thiserror::Error;

/// Errors surfaced by broker-backed operations
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Stream '{stream}' has no group '{group}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("Malformed queue payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl FabricError {
    /// Check whether retrying the operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, FabricError::Connection(_))
    }
}
