//! Shared types for livecast.
//!
//! This crate defines the data exchanged between the encoder side, the
//! protocol clients and the caller: encoded access units, format
//! descriptions, stream configuration and connection lifecycle events.

mod commands;
mod events;
mod state;
mod types;

pub use commands::{EngineCommand, MediaInput};
pub use events::{ConnectionEvent, EventSink};
pub use state::ConnectionState;
pub use types::{
    AudioCodec, AudioInfo, ClientType, EncodedUnit, KeyLength, RtspTransport, StreamConfig,
    UnitKind, VideoCodec, VideoInfo,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for engine commands (caller → engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for connection events (core → caller).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for encoded media (encoder → engine).
pub const MEDIA_CHANNEL_CAPACITY: usize = 120;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<EngineCommand>, Receiver<EngineCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel and wraps the sending half in an [`EventSink`].
pub fn event_channel() -> (EventSink, Receiver<ConnectionEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY);
    (EventSink::new(tx), rx)
}

/// Creates a bounded media channel.
pub fn media_channel() -> (Sender<MediaInput>, Receiver<MediaInput>) {
    crossbeam_channel::bounded(MEDIA_CHANNEL_CAPACITY)
}
