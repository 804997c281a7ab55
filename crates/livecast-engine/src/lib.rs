//! Stream dispatch for livecast.
//!
//! This crate puts one control surface over the RTMP, RTSP and SRT clients
//! and runs the command loop that drives it from channels.

mod dispatcher;
mod error;
mod orchestrator;

pub use dispatcher::StreamDispatcher;
pub use error::{EngineError, EngineResult};
pub use orchestrator::Engine;

use crossbeam_channel::Receiver;
use livecast_ipc::{EngineCommand, EventSink, MediaInput, StreamConfig};

/// Create an engine instance with IPC channels.
pub fn create_engine(
    command_rx: Receiver<EngineCommand>,
    media_rx: Receiver<MediaInput>,
    config: StreamConfig,
    events: EventSink,
) -> Engine {
    Engine::new(command_rx, media_rx, config, events)
}
