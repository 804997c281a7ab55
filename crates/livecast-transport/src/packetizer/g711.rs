//! G.711 over RTP (RFC 3551, RFC 7655).

use livecast_ipc::EncodedUnit;

use super::rtp::{chunks, RtpStream};
use super::{Packetizer, PAYLOAD_TYPE_PCMA};
use crate::wire::{FrameKind, Track, WireFrame};

/// Splits G.711 A-law frames into RTP packets.
///
/// A frame larger than the payload budget becomes several packets sharing
/// one timestamp; the marker is set on the last one only.
pub struct G711Packetizer {
    stream: RtpStream,
}

impl G711Packetizer {
    /// Create a packetizer clocked at `sample_rate`.
    pub fn new(sample_rate: u32, mtu: usize) -> Self {
        Self {
            stream: RtpStream::new(PAYLOAD_TYPE_PCMA, sample_rate, Track::Audio, mtu),
        }
    }
}

impl Packetizer for G711Packetizer {
    fn packetize(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        if unit.is_empty() {
            return Vec::new();
        }

        let timestamp = self.stream.timestamp(unit.pts_us);
        let max = self.stream.max_payload();
        let count = unit.data.len().div_ceil(max);

        chunks(&unit.data, max)
            .enumerate()
            .map(|(i, chunk)| {
                self.stream
                    .packet(timestamp, i + 1 == count, FrameKind::Audio, &[&chunk[..]])
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packetizer::RtpHeader;

    #[test]
    fn test_small_frame_is_one_packet() {
        let mut packetizer = G711Packetizer::new(8000, 1500);
        let first = packetizer.packetize(&EncodedUnit::audio(vec![0xD5; 160], 0));
        let second = packetizer.packetize(&EncodedUnit::audio(vec![0xD5; 160], 20_000));

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        let a = RtpHeader::parse(&first[0].data).unwrap();
        let b = RtpHeader::parse(&second[0].data).unwrap();
        assert_eq!(b.sequence_number, a.sequence_number.wrapping_add(1));
        assert_eq!(b.timestamp, 160);
        assert_eq!(a.payload_type, 8);
        assert!(a.marker);
    }

    #[test]
    fn test_large_frame_is_split() {
        let mut packetizer = G711Packetizer::new(8000, 1500);
        let max = 1460;
        let len = max * 3 + 17;
        let frames = packetizer.packetize(&EncodedUnit::audio(vec![0x55; len], 40_000));

        assert_eq!(frames.len(), len.div_ceil(max));
        let headers: Vec<_> = frames
            .iter()
            .map(|f| RtpHeader::parse(&f.data).unwrap())
            .collect();
        for (i, header) in headers.iter().enumerate() {
            assert_eq!(header.timestamp, 320);
            assert_eq!(header.sequence_number, i as u16);
            assert_eq!(header.marker, i == headers.len() - 1);
            assert!(frames[i].data.len() - 12 <= max);
        }
        let total: usize = frames.iter().map(|f| f.data.len() - 12).sum();
        assert_eq!(total, len);
    }

    #[test]
    fn test_empty_frame_is_ignored() {
        let mut packetizer = G711Packetizer::new(8000, 1500);
        assert!(packetizer.packetize(&EncodedUnit::audio(Vec::new(), 0)).is_empty());
    }
}
