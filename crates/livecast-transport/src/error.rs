//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost while streaming.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Endpoint URL could not be used.
    #[error("Endpoint malformed, {0}")]
    InvalidEndpoint(String),

    /// Feature not available for this endpoint.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Send error.
    #[error("Send error: {0}")]
    Send(String),

    /// The server did not answer in time.
    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    /// The attempt was cancelled by disconnect().
    #[error("connection cancelled")]
    Cancelled,

    /// Cache cannot be resized.
    #[error("Cache resize rejected: {0}")]
    CacheResize(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error reported by the peer or the session layer.
    #[error("{0}")]
    Protocol(String),
}

impl TransportError {
    /// Returns true for credential rejections.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }
}
