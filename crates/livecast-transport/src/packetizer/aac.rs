//! AAC over RTP, mpeg4-generic AAC-hbr mode (RFC 3640).

use livecast_ipc::{AudioInfo, EncodedUnit};

use super::rtp::{chunks, RtpStream};
use super::{Packetizer, PAYLOAD_TYPE_AAC};
use crate::wire::{FrameKind, Track, WireFrame};

/// AU-headers-length (16 bits) plus one 16-bit AU-header.
const AU_HEADER_SECTION_SIZE: usize = 4;

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AAC LC audio object type.
const OBJECT_TYPE_LC: u8 = 2;

/// Sampling frequency index of `sample_rate`, 44.1 kHz when unlisted.
pub fn frequency_index(sample_rate: u32) -> u8 {
    SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(4) as u8
}

/// Two-byte AudioSpecificConfig for AAC LC.
pub fn audio_specific_config(info: &AudioInfo) -> [u8; 2] {
    let index = frequency_index(info.sample_rate);
    let config = (OBJECT_TYPE_LC as u16) << 11
        | (index as u16) << 7
        | (info.channels.clamp(1, 7) as u16) << 3;
    config.to_be_bytes()
}

/// ADTS header for one raw AAC frame of `payload_len` bytes.
pub fn adts_header(info: &AudioInfo, payload_len: usize) -> [u8; 7] {
    let index = frequency_index(info.sample_rate);
    let channels = info.channels.clamp(1, 7);
    let frame_len = (payload_len + 7).min(0x1FFF);
    [
        0xFF,
        // MPEG-4, layer 0, no CRC
        0xF1,
        ((OBJECT_TYPE_LC - 1) << 6) | (index << 2) | (channels >> 2),
        ((channels & 0x03) << 6) | (frame_len >> 11) as u8,
        (frame_len >> 3) as u8,
        ((frame_len as u8 & 0x07) << 5) | 0x1F,
        0xFC,
    ]
}

/// Packs one raw AAC frame per RTP packet behind an AU-header section.
///
/// Frames over the payload budget are fragmented; every fragment repeats
/// the AU-header with the full frame size and only the last sets the marker.
pub struct AacPacketizer {
    stream: RtpStream,
}

impl AacPacketizer {
    /// Create a packetizer clocked at `sample_rate`.
    pub fn new(sample_rate: u32, mtu: usize) -> Self {
        Self {
            stream: RtpStream::new(PAYLOAD_TYPE_AAC, sample_rate, Track::Audio, mtu),
        }
    }
}

impl Packetizer for AacPacketizer {
    fn packetize(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        if unit.is_empty() {
            return Vec::new();
        }

        // 13-bit AU-size, 3-bit AU-index of zero.
        let size = (unit.data.len().min(0x1FFF) as u16) << 3;
        let section = [0x00, 0x10, (size >> 8) as u8, size as u8];

        let timestamp = self.stream.timestamp(unit.pts_us);
        let max = self.stream.max_payload() - AU_HEADER_SECTION_SIZE;
        let count = unit.data.len().div_ceil(max);

        chunks(&unit.data, max)
            .enumerate()
            .map(|(i, chunk)| {
                self.stream.packet(
                    timestamp,
                    i + 1 == count,
                    FrameKind::Audio,
                    &[&section[..], &chunk[..]],
                )
            })
            .collect()
    }

    fn reset(&mut self) {
        self.stream.reset();
    }

    fn rtp_stream(&mut self) -> &mut RtpStream {
        &mut self.stream
    }
}
