//! H.265 over RTP (RFC 7798).

use bytes::{BufMut, BytesMut};
use livecast_ipc::{EncodedUnit, VideoCodec, VideoInfo};

use super::rtp::{chunks, RtpStream};
use super::{Packetizer, PAYLOAD_TYPE_VIDEO, VIDEO_CLOCK_RATE};
use crate::nal;
use crate::wire::{FrameKind, Track, WireFrame};

const AGGREGATION_PACKET: u8 = 48;
const FRAGMENTATION_UNIT: u8 = 49;

/// Emits single NAL unit packets and FU fragments; VPS, SPS and PPS go
/// out in an aggregation packet ahead of every key-frame.
pub struct H265Packetizer {
    stream: RtpStream,
    parameter_sets: BytesMut,
}

impl H265Packetizer {
    /// Create a packetizer for the given parameter sets.
    pub fn new(info: &VideoInfo, mtu: usize) -> Self {
        let mut ap = BytesMut::new();
        if let (Some(vps), true) = (&info.vps, info.is_complete()) {
            // layer 0, TID 1
            ap.put_u8(AGGREGATION_PACKET << 1);
            ap.put_u8(0x01);
            for nal in [vps, &info.sps, &info.pps] {
                ap.put_u16(nal.len() as u16);
                ap.put_slice(nal);
            }
        }
        Self {
            stream: RtpStream::new(PAYLOAD_TYPE_VIDEO, VIDEO_CLOCK_RATE, Track::Video, mtu),
            parameter_sets: ap,
        }
    }
}

impl Packetizer for H265Packetizer {
    fn packetize(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        let nals: Vec<_> = nal::split_annex_b(&unit.data)
            .into_iter()
            .filter(|n| n.len() > 2 && !nal::is_parameter_set(VideoCodec::H265, n))
            .collect();
        if nals.is_empty() {
            return Vec::new();
        }

        let timestamp = self.stream.timestamp(unit.pts_us);
        let kind = if unit.is_keyframe() {
            FrameKind::KeyFrame
        } else {
            FrameKind::Video
        };
        let max = self.stream.max_payload();
        let mut frames = Vec::new();

        if unit.is_keyframe()
            && !self.parameter_sets.is_empty()
            && self.parameter_sets.len() <= max
        {
            frames.push(
                self.stream
                    .packet(timestamp, false, FrameKind::Config, &[&self.parameter_sets[..]]),
            );
        }

        let last_nal = nals.len() - 1;
        for (n, nal) in nals.iter().enumerate() {
            let end_of_unit = n == last_nal;
            if nal.len() <= max {
                frames.push(self.stream.packet(timestamp, end_of_unit, kind, &[&nal[..]]));
                continue;
            }

            // Payload header keeps F, layer id and TID, type becomes FU.
            let payload_header = [(nal[0] & 0x81) | (FRAGMENTATION_UNIT << 1), nal[1]];
            let nal_type = nal::nal_type(VideoCodec::H265, nal[0]);
            let body = nal.slice(2..);
            let count = body.len().div_ceil(max - 3);
            for (i, chunk) in chunks(&body, max - 3).enumerate() {
                let mut fu_header = nal_type;
                if i == 0 {
                    fu_header |= 0x80;
                }
                if i + 1 == count {
                    fu_header |= 0x40;
                }
                let marker = end_of_unit && i + 1 == count;
                frames.push(self.stream.packet(
                    timestamp,
                    marker,
                    kind,
                    &[&payload_header[..], &[fu_header][..], &chunk[..]],
                ));
            }
        }

        frames
    }

    fn reset(&mut self) {
        self.stream.reset();
    }

    fn rtp_stream(&mut self) -> &mut RtpStream {
        &mut self.stream
    }
}
