//! H.264 over RTP (RFC 6184), non-interleaved mode.

use bytes::{BufMut, BytesMut};
use livecast_ipc::{EncodedUnit, VideoCodec, VideoInfo};

use super::rtp::{chunks, RtpStream};
use super::{Packetizer, PAYLOAD_TYPE_VIDEO, VIDEO_CLOCK_RATE};
use crate::nal;
use crate::wire::{FrameKind, Track, WireFrame};

const STAP_A: u8 = 24;
const FU_A: u8 = 28;

/// Emits single NAL unit packets and FU-A fragments.
///
/// SPS and PPS travel in a STAP-A packet ahead of every key-frame; copies
/// found inside the access unit are dropped.
pub struct H264Packetizer {
    stream: RtpStream,
    parameter_sets: BytesMut,
}

impl H264Packetizer {
    /// Create a packetizer for the given parameter sets.
    pub fn new(info: &VideoInfo, mtu: usize) -> Self {
        let mut stap = BytesMut::new();
        if info.is_complete() {
            // F and NRI of the SPS, type 24
            stap.put_u8((info.sps[0] & 0xE0) | STAP_A);
            for nal in [&info.sps, &info.pps] {
                stap.put_u16(nal.len() as u16);
                stap.put_slice(nal);
            }
        }
        Self {
            stream: RtpStream::new(PAYLOAD_TYPE_VIDEO, VIDEO_CLOCK_RATE, Track::Video, mtu),
            parameter_sets: stap,
        }
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        let nals: Vec<_> = nal::split_annex_b(&unit.data)
            .into_iter()
            .filter(|n| !n.is_empty() && !nal::is_parameter_set(VideoCodec::H264, n))
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

            let indicator = (nal[0] & 0xE0) | FU_A;
            let nal_type = nal[0] & 0x1F;
            let body = nal.slice(1..);
            let count = body.len().div_ceil(max - 2);
            for (i, chunk) in chunks(&body, max - 2).enumerate() {
                let mut header = nal_type;
                if i == 0 {
                    header |= 0x80;
                }
                if i + 1 == count {
                    header |= 0x40;
                }
                let marker = end_of_unit && i + 1 == count;
                frames.push(self.stream.packet(
                    timestamp,
                    marker,
                    kind,
                    &[&[indicator, header][..], &chunk[..]],
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packetizer::RtpHeader;
    use bytes::Bytes;

    fn info() -> VideoInfo {
        VideoInfo::new(
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
            None,
        )
    }

    #[test]
    fn test_single_nal_packet() {
        let mut packetizer = H264Packetizer::new(&info(), 1500);
        let frames = packetizer.packetize(&EncodedUnit::video(
            vec![0, 0, 0, 1, 0x41, 0x9A, 0x01],
            33_333,
            false,
        ));

        assert_eq!(frames.len(), 1);
        let header = RtpHeader::parse(&frames[0].data).unwrap();
        assert!(header.marker);
        assert_eq!(header.timestamp, 2999);
        assert_eq!(&frames[0].data[12..], &[0x41, 0x9A, 0x01]);
        assert_eq!(frames[0].kind, FrameKind::Video);
    }

    #[test]
    fn test_keyframe_carries_parameter_sets() {
        let mut packetizer = H264Packetizer::new(&info(), 1500);
        let frames = packetizer.packetize(&EncodedUnit::video(
            vec![
                0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, // in-band SPS, dropped
                0, 0, 0, 1, 0x65, 0x88, 0x84,
            ],
            0,
            true,
        ));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Config);
        assert_eq!(frames[0].data[12] & 0x1F, STAP_A);
        assert!(!RtpHeader::parse(&frames[0].data).unwrap().marker);
        assert_eq!(frames[1].kind, FrameKind::KeyFrame);
        assert_eq!(&frames[1].data[12..], &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_fu_a_fragmentation() {
        let mut packetizer = H264Packetizer::new(&info(), 1500);
        let mut data: Vec<u8> = vec![0, 0, 0, 1, 0x41];
        data.extend(std::iter::repeat(0xAB).take(4000));
        let frames = packetizer.packetize(&EncodedUnit::video(data, 0, false));

        // 4000 body bytes in 1458-byte fragments
        assert_eq!(frames.len(), 3);
        let first = &frames[0].data;
        assert_eq!(first[12], 0x40 | FU_A);
        assert_eq!(first[13], 0x80 | 0x01);
        assert_eq!(frames[1].data[13], 0x01);
        assert_eq!(frames[2].data[13], 0x40 | 0x01);

        let seqs: Vec<_> = frames
            .iter()
            .map(|f| RtpHeader::parse(&f.data).unwrap())
            .collect();
        assert!(seqs.windows(2).all(|w| w[1].sequence_number == w[0].sequence_number + 1));
        assert!(!seqs[0].marker && !seqs[1].marker && seqs[2].marker);
        assert!(frames.iter().all(|f| f.data.len() <= 1472));
    }

    #[test]
    fn test_empty_unit() {
        let mut packetizer = H264Packetizer::new(&info(), 1500);
        assert!(packetizer
            .packetize(&EncodedUnit::video(Vec::new(), 0, true))
            .is_empty());
    }
}
