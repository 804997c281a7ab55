//! Error types for the engine.

use livecast_transport::TransportError;
use thiserror::Error;

/// Errors returned by the dispatcher and the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The URL scheme selects none of the protocol clients.
    #[error("unsupported protocol. Only support rtmp, rtsp and srt")]
    UnsupportedProtocol(String),

    /// A protocol client refused the request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A worker thread could not be started.
    #[error("failed to start {0} thread: {1}")]
    Thread(&'static str, std::io::Error),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
