//! Error types for commux.

use thiserror::Error;

/// Top-level error type for commux operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Frame or command codec error
    #[error("codec error: {0}")]
    Codec(String),

    /// Protocol violation on a peer connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An argument failed validation before reaching the wire
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking call expired without a reply
    #[error("timed out waiting for a reply")]
    Timeout,

    /// The component↔core channel is gone
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for commux operations.
pub type Result<T> = std::result::Result<T, Error>;
