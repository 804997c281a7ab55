//! Transmittable units produced by packetizers.

use bytes::Bytes;

/// Elementary stream a wire frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Video,
    Audio,
}

/// Drop priority class of a wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Decoder configuration (sequence headers, PAT/PMT). Never dropped first.
    Config,

    /// Part of a video key-frame.
    KeyFrame,

    /// Part of a video delta frame.
    Video,

    /// Audio.
    Audio,
}

impl FrameKind {
    /// Frames the decoder needs to resynchronize.
    pub fn is_key(self) -> bool {
        matches!(self, Self::Config | Self::KeyFrame)
    }
}

/// One transmittable unit: protocol header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Bytes written to the transport (RTP packet, FLV tag body, SRT payload).
    pub data: Bytes,

    /// Wire clock: RTP timestamp, RTMP milliseconds or MPEG-TS 90 kHz PTS.
    pub timestamp: u32,

    /// Drop priority class.
    pub kind: FrameKind,

    /// Track used to route the frame (RTP channel or UDP port, RTMP message type).
    pub track: Track,
}

impl WireFrame {
    /// Create a wire frame.
    pub fn new(data: Bytes, timestamp: u32, kind: FrameKind, track: Track) -> Self {
        Self {
            data,
            timestamp,
            kind,
            track,
        }
    }

    /// Number of bytes on the wire.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when the frame carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
