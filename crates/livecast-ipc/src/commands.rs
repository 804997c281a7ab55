//! Messages sent from the caller to the engine.

use serde::{Deserialize, Serialize};

use crate::types::{AudioInfo, EncodedUnit, StreamConfig, VideoInfo};

/// Session control commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Connect to the given endpoint URL.
    Connect { url: String },

    /// Disconnect the active client.
    Disconnect,

    /// Retry the active connection after a delay.
    Retry {
        delay_ms: u64,
        reason: String,
        backup_url: Option<String>,
    },

    /// Apply a configuration to every client.
    ApplyConfig(Box<StreamConfig>),

    /// Disconnect and stop the engine.
    Shutdown,
}

/// Encoded media handed over by the encoder side.
#[derive(Debug, Clone)]
pub enum MediaInput {
    /// Video parameter sets (delivered once, and again whenever they change).
    VideoInfo(VideoInfo),

    /// Audio format description.
    AudioInfo(AudioInfo),

    /// One encoded video access unit.
    Video(EncodedUnit),

    /// One encoded audio access unit.
    Audio(EncodedUnit),
}
