//! RTP framing (RFC 3550) shared by the codec packetizers.

use bytes::{BufMut, Bytes, BytesMut};
use livecast_ipc::{AudioCodec, AudioInfo, EncodedUnit, VideoCodec, VideoInfo};
use tracing::debug;

use super::{
    max_rtp_packet_size, scale_timestamp, AacPacketizer, G711Packetizer, H264Packetizer,
    H265Packetizer, MediaPacketizer, Packetizer, RTP_HEADER_SIZE,
};
use crate::wire::{FrameKind, Track, WireFrame};

const RTP_VERSION: u8 = 2;

/// RTP fixed header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_SIZE || data[0] >> 6 != RTP_VERSION {
            return None;
        }
        Some(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Append the serialized header to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(RTP_VERSION << 6);
        let marker = if self.marker { 0x80 } else { 0 };
        buf.put_u8(marker | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }
}

/// Sequence and clock state of one RTP stream.
#[derive(Debug)]
pub struct RtpStream {
    payload_type: u8,
    clock_rate: u32,
    track: Track,
    ssrc: u32,
    sequence: u16,
    max_packet_size: usize,
}

impl RtpStream {
    /// Create a stream with a random SSRC.
    pub fn new(payload_type: u8, clock_rate: u32, track: Track, mtu: usize) -> Self {
        Self {
            payload_type,
            clock_rate,
            track,
            ssrc: rand::random(),
            sequence: 0,
            max_packet_size: max_rtp_packet_size(mtu),
        }
    }

    /// Largest payload one packet may carry.
    pub fn max_payload(&self) -> usize {
        self.max_packet_size - RTP_HEADER_SIZE
    }

    /// Clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Synchronization source.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// RTP timestamp of a presentation time.
    pub fn timestamp(&self, pts_us: u64) -> u32 {
        scale_timestamp(pts_us, self.clock_rate)
    }

    /// Build one packet from `parts` and advance the sequence number.
    pub fn packet(
        &mut self,
        timestamp: u32,
        marker: bool,
        kind: FrameKind,
        parts: &[&[u8]],
    ) -> WireFrame {
        let payload_len: usize = parts.iter().map(|p| p.len()).sum();
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + payload_len);
        RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence_number: self.sequence,
            timestamp,
            ssrc: self.ssrc,
        }
        .write(&mut buf);
        for part in parts {
            buf.put_slice(part);
        }
        self.sequence = self.sequence.wrapping_add(1);
        WireFrame::new(buf.freeze(), timestamp, kind, self.track)
    }

    /// Continue the numbering of `previous` on this stream.
    pub fn continue_from(&mut self, previous: &RtpStream) {
        self.ssrc = previous.ssrc;
        self.sequence = previous.sequence;
    }

    /// Restart numbering with a new SSRC.
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.ssrc = rand::random();
    }
}

/// RTP packetization of both tracks for the RTSP client.
///
/// New format information for an unchanged codec keeps the track's SSRC
/// and sequence numbers.
pub struct RtpPacketizer {
    mtu: usize,
    video: Option<Box<dyn Packetizer>>,
    video_codec: Option<VideoCodec>,
    audio: Option<Box<dyn Packetizer>>,
    audio_format: Option<(AudioCodec, u32)>,
}

impl RtpPacketizer {
    /// Create a packetizer sized for `mtu`. Codecs are chosen once the
    /// format information arrives.
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            video: None,
            video_codec: None,
            audio: None,
            audio_format: None,
        }
    }

    /// Change the MTU. Takes effect for packetizers created afterwards.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }
}

impl MediaPacketizer for RtpPacketizer {
    fn set_video_info(&mut self, info: &VideoInfo) {
        debug!(codec = ?info.codec(), mtu = self.mtu, "Configuring RTP video packetizer");
        let mut next: Box<dyn Packetizer> = match info.codec() {
            VideoCodec::H264 => Box::new(H264Packetizer::new(info, self.mtu)),
            VideoCodec::H265 => Box::new(H265Packetizer::new(info, self.mtu)),
        };
        if let Some(ref mut previous) = self.video {
            if self.video_codec == Some(info.codec()) {
                next.rtp_stream().continue_from(previous.rtp_stream());
            }
        }
        self.video = Some(next);
        self.video_codec = Some(info.codec());
    }

    fn set_audio_info(&mut self, info: &AudioInfo) {
        debug!(codec = ?info.codec, rate = info.sample_rate, "Configuring RTP audio packetizer");
        let mut next: Box<dyn Packetizer> = match info.codec {
            AudioCodec::Aac => Box::new(AacPacketizer::new(info.sample_rate, self.mtu)),
            AudioCodec::G711 => Box::new(G711Packetizer::new(info.sample_rate, self.mtu)),
        };
        let format = (info.codec, info.sample_rate);
        if let Some(ref mut previous) = self.audio {
            if self.audio_format == Some(format) {
                next.rtp_stream().continue_from(previous.rtp_stream());
            }
        }
        self.audio = Some(next);
        self.audio_format = Some(format);
    }

    fn packetize_video(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        match self.video {
            Some(ref mut p) => p.packetize(unit),
            None => Vec::new(),
        }
    }

    fn packetize_audio(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        match self.audio {
            Some(ref mut p) => p.packetize(unit),
            None => Vec::new(),
        }
    }

    fn reset(&mut self) {
        if let Some(ref mut p) = self.video {
            p.reset();
        }
        if let Some(ref mut p) = self.audio {
            p.reset();
        }
    }
}

/// Split `payload` into chunks of at most `max` bytes.
pub(crate) fn chunks(payload: &Bytes, max: usize) -> impl Iterator<Item = Bytes> + '_ {
    let max = max.max(1);
    (0..payload.len())
        .step_by(max)
        .map(move |start| payload.slice(start..(start + max).min(payload.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut stream = RtpStream::new(96, 90_000, Track::Video, 1500);
        let frame = stream.packet(1234, true, FrameKind::Video, &[&[0xAA, 0xBB]]);
        let header = RtpHeader::parse(&frame.data).unwrap();

        assert_eq!(frame.data[0], 0x80);
        assert!(header.marker);
        assert_eq!(header.payload_type, 96);
        assert_eq!(header.sequence_number, 0);
        assert_eq!(header.timestamp, 1234);
        assert_eq!(header.ssrc, stream.ssrc());
        assert_eq!(&frame.data[12..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut stream = RtpStream::new(8, 8000, Track::Audio, 1500);
        stream.sequence = u16::MAX;
        let a = stream.packet(0, false, FrameKind::Audio, &[&[1]]);
        let b = stream.packet(0, false, FrameKind::Audio, &[&[2]]);
        assert_eq!(RtpHeader::parse(&a.data).unwrap().sequence_number, u16::MAX);
        assert_eq!(RtpHeader::parse(&b.data).unwrap().sequence_number, 0);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut stream = RtpStream::new(97, 44_100, Track::Audio, 1500);
        stream.packet(0, false, FrameKind::Audio, &[&[1]]);
        stream.reset();
        let frame = stream.packet(0, false, FrameKind::Audio, &[&[1]]);
        assert_eq!(RtpHeader::parse(&frame.data).unwrap().sequence_number, 0);
    }

    #[test]
    fn test_chunks() {
        let payload = Bytes::from_static(&[0, 1, 2, 3, 4]);
        let parts: Vec<_> = chunks(&payload, 2).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].as_ref(), &[4]);
    }

    #[test]
    fn test_unconfigured_tracks_produce_nothing() {
        let mut packetizer = RtpPacketizer::new(1500);
        let unit = EncodedUnit::audio(vec![1, 2, 3], 0);
        assert!(packetizer.packetize_audio(&unit).is_empty());
        packetizer.set_audio_info(&AudioInfo {
            sample_rate: 8000,
            channels: 1,
            codec: AudioCodec::G711,
        });
        assert_eq!(packetizer.packetize_audio(&unit).len(), 1);
    }

    fn sequence_and_ssrc(frame: &WireFrame) -> (u16, u32) {
        let header = RtpHeader::parse(&frame.data).unwrap();
        (header.sequence_number, header.ssrc)
    }

    #[test]
    fn test_new_parameter_sets_keep_numbering() {
        let info = VideoInfo::new(
            Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
            None,
        );
        let unit = EncodedUnit::video(vec![0, 0, 0, 1, 0x41, 0x9A, 0x02], 0, false);
        let mut packetizer = RtpPacketizer::new(1500);
        packetizer.set_video_info(&info);

        let first = sequence_and_ssrc(&packetizer.packetize_video(&unit)[0]);
        let second = sequence_and_ssrc(&packetizer.packetize_video(&unit)[0]);
        packetizer.set_video_info(&info);
        let third = sequence_and_ssrc(&packetizer.packetize_video(&unit)[0]);

        assert_eq!([first.0, second.0, third.0], [0, 1, 2]);
        assert_eq!(first.1, third.1);
    }

    #[test]
    fn test_new_audio_rate_restarts_numbering() {
        let unit = EncodedUnit::audio(vec![1, 2, 3], 0);
        let mut packetizer = RtpPacketizer::new(1500);
        let mut info = AudioInfo {
            sample_rate: 8000,
            channels: 1,
            codec: AudioCodec::G711,
        };
        packetizer.set_audio_info(&info);
        packetizer.packetize_audio(&unit);
        packetizer.set_audio_info(&info);
        assert_eq!(sequence_and_ssrc(&packetizer.packetize_audio(&unit)[0]).0, 1);

        info.sample_rate = 16_000;
        packetizer.set_audio_info(&info);
        assert_eq!(sequence_and_ssrc(&packetizer.packetize_audio(&unit)[0]).0, 0);
    }
}
