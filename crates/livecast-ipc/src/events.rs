//! Connection lifecycle events sent from the core to the caller.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Events a protocol client or the dispatcher reports to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// A connection attempt to `url` has started.
    ConnectionStarted { url: String },

    /// The handshake completed and the client is streaming.
    ConnectionSuccess,

    /// The connection attempt failed or an established connection broke.
    ConnectionFailed { reason: String },

    /// The client was torn down by the caller.
    Disconnect,

    /// The server rejected the credentials.
    AuthError,

    /// The server accepted the credentials.
    AuthSuccess,

    /// Measured outgoing bitrate over the last second.
    NewBitrate { bits_per_second: u64 },

    /// The encoder should produce a key-frame as soon as possible.
    KeyframeRequested,
}

impl ConnectionEvent {
    /// Returns true for the events that end a connection attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionSuccess | Self::ConnectionFailed { .. } | Self::AuthError
        )
    }
}

/// Sending half of the event channel.
///
/// Emitting never blocks: when the caller stops draining the channel,
/// events are dropped with a warning.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<ConnectionEvent>,
}

impl EventSink {
    /// Wrap an existing channel sender.
    pub fn new(tx: Sender<ConnectionEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event to the caller.
    pub fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Failed to deliver connection event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(ConnectionEvent::ConnectionSuccess.is_terminal());
        assert!(ConnectionEvent::AuthError.is_terminal());
        assert!(ConnectionEvent::ConnectionFailed {
            reason: "timeout".into()
        }
        .is_terminal());
        assert!(!ConnectionEvent::Disconnect.is_terminal());
        assert!(!ConnectionEvent::NewBitrate { bits_per_second: 1 }.is_terminal());
    }

    #[test]
    fn test_sink_delivers_in_order() {
        let (sink, rx) = crate::event_channel();
        sink.emit(ConnectionEvent::ConnectionStarted {
            url: "rtmp://localhost/live/key".into(),
        });
        sink.emit(ConnectionEvent::ConnectionSuccess);

        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionEvent::ConnectionStarted { .. })
        ));
        assert_eq!(rx.try_recv(), Ok(ConnectionEvent::ConnectionSuccess));
    }

    #[test]
    fn test_full_channel_does_not_block() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sink = EventSink::new(tx);
        sink.emit(ConnectionEvent::AuthSuccess);
        sink.emit(ConnectionEvent::AuthError);

        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv(), Ok(ConnectionEvent::AuthSuccess));
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (sink, rx) = crate::event_channel();
        drop(rx);
        sink.emit(ConnectionEvent::Disconnect);
    }
}
