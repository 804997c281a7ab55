//! Protocol client state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one protocol client.
///
/// ```text
/// Idle → Connecting → (Authenticating) → Connected → Disconnecting → Idle
///   any state → Failed;  Failed → Idle only through disconnect()
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection, nothing running.
    #[default]
    Idle,

    /// Opening the transport and performing the handshake.
    Connecting,

    /// Exchanging credentials with the server.
    Authenticating,

    /// Handshake done, frames are being sent.
    Connected,

    /// Tearing the connection down.
    Disconnecting,

    /// The attempt or the stream failed. Stays here until disconnect().
    Failed {
        /// Human readable reason.
        reason: String,
    },
}

impl ConnectionState {
    /// Returns true if the client is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the client is streaming.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns true while a connection attempt is in progress.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating)
    }

    /// Returns true if the client is in the failed state.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Authenticating => "Authenticating",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
            Self::Failed { .. } => "Failed",
        }
    }

    /// Status message for display.
    pub fn message(&self) -> String {
        match self {
            Self::Failed { reason } => format!("Failed: {}", reason),
            Self::Connecting => "Connecting...".to_string(),
            Self::Authenticating => "Authenticating...".to_string(),
            Self::Disconnecting => "Disconnecting...".to_string(),
            other => other.name().to_string(),
        }
    }
}
