//! Packetizers turn encoded access units into wire frames.
//!
//! Each protocol client owns one [`MediaPacketizer`]: RTSP uses one RTP
//! [`Packetizer`] per elementary stream, RTMP builds FLV tag bodies and SRT
//! carries an MPEG-TS multiplex.

mod aac;
mod flv;
mod g711;
mod h264;
mod h265;
mod rtp;
mod ts;

pub use aac::{adts_header, audio_specific_config, frequency_index, AacPacketizer};
pub use flv::FlvPacketizer;
pub use g711::G711Packetizer;
pub use h264::H264Packetizer;
pub use h265::H265Packetizer;
pub use rtp::{RtpHeader, RtpPacketizer, RtpStream};
pub use ts::{crc32_mpeg2, TsPacketizer, TS_PACKETS_PER_PAYLOAD, TS_PACKET_SIZE};

use livecast_ipc::{AudioInfo, EncodedUnit, VideoInfo};

use crate::wire::WireFrame;

/// Payload type for dynamic video (H264, H265).
pub const PAYLOAD_TYPE_VIDEO: u8 = 96;

/// Payload type for dynamic AAC.
pub const PAYLOAD_TYPE_AAC: u8 = 97;

/// Static payload type for G.711 A-law.
pub const PAYLOAD_TYPE_PCMA: u8 = 8;

/// RTP clock for video.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Fixed RTP header size.
pub const RTP_HEADER_SIZE: usize = 12;

/// IPv4 plus UDP header overhead.
pub const IP_UDP_OVERHEAD: usize = 28;

/// Fragments one elementary stream into wire frames.
pub trait Packetizer: Send {
    /// Packetize one access unit. Empty units produce nothing.
    fn packetize(&mut self, unit: &EncodedUnit) -> Vec<WireFrame>;

    /// Restart sequence numbering and timestamp state.
    fn reset(&mut self);

    /// The RTP stream the packets are numbered on.
    fn rtp_stream(&mut self) -> &mut RtpStream;
}

/// Packetization for both tracks of one protocol session.
pub trait MediaPacketizer: Send {
    /// Store video parameter sets. Sent in band ahead of key-frames where
    /// the protocol needs them.
    fn set_video_info(&mut self, info: &VideoInfo);

    /// Store the audio format.
    fn set_audio_info(&mut self, info: &AudioInfo);

    /// Packetize a video access unit.
    fn packetize_video(&mut self, unit: &EncodedUnit) -> Vec<WireFrame>;

    /// Packetize an audio access unit.
    fn packetize_audio(&mut self, unit: &EncodedUnit) -> Vec<WireFrame>;

    /// Forget per-connection state. Format information is kept.
    fn reset(&mut self);
}

/// Largest RTP packet, header included, that fits in `mtu`.
pub fn max_rtp_packet_size(mtu: usize) -> usize {
    mtu.saturating_sub(IP_UDP_OVERHEAD).max(RTP_HEADER_SIZE + 16)
}

/// Scale a microsecond timestamp to `clock_rate` ticks.
pub fn scale_timestamp(pts_us: u64, clock_rate: u32) -> u32 {
    (pts_us as u128 * clock_rate as u128 / 1_000_000) as u32
}
