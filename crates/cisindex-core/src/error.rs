//! Error types for the cisindex pipeline.

use thiserror::Error;

/// Errors that can occur during ingestion.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Node error: {0}")]
    Node(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Block {height} not available on node")]
    BlockNotFound { height: u64 },

    #[error("Shutting down")]
    Shutdown,

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for node/store failures the owning stage should retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Node(_) | Self::Storage(_) | Self::BlockNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
