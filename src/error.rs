//! Error types for blobbridge

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Startup connectivity or provisioning failure. Always fatal.
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Change feed disconnect or subscription failure. Always fatal.
    #[error("Change feed error: {0}")]
    Feed(String),

    /// Sink enumeration failure during restore. Always fatal.
    #[error("Listing error: {0}")]
    Listing(String),

    /// Per-entry failure against the source store.
    #[error("Source store error: {0}")]
    Source(String),

    /// Per-object failure against the sink store.
    #[error("Sink store error: {0}")]
    Sink(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// A delete against a key that is already gone. At-least-once delivery
    /// makes this a converged no-op, not a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound(_))
    }

    /// Check if error is worth retrying before the item is dropped
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Source(_) | BridgeError::Sink(_) | BridgeError::Io(_)
        )
    }
}
