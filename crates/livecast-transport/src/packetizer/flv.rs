//! FLV tag bodies for the RTMP client.
//!
//! The RTMP session adds the message header and splits each body into
//! chunks, so the packetizer only produces the FLV audio/video tag payload:
//!
//! - H.264: `[frame type | codec 7] [AVC packet type] [composition time (3)] data`
//! - H.265: enhanced RTMP, `[0x80 | frame type | packet type] "hvc1" data`
//! - AAC: `[0xAF] [AAC packet type] data`
//! - G.711 A-law: `[0x72] data`

use bytes::{BufMut, Bytes, BytesMut};
use livecast_ipc::{AudioCodec, AudioInfo, EncodedUnit, VideoCodec, VideoInfo};
use tracing::{debug, trace};

use super::aac::audio_specific_config;
use super::MediaPacketizer;
use crate::nal;
use crate::wire::{FrameKind, Track, WireFrame};

const AVC_CODEC_ID: u8 = 0x07;
const FRAME_TYPE_KEY: u8 = 0x10;
const FRAME_TYPE_INTER: u8 = 0x20;

const EX_HEADER: u8 = 0x80;
const PACKET_TYPE_SEQUENCE_START: u8 = 0;
const PACKET_TYPE_CODED_FRAMES_X: u8 = 3;
const HEVC_FOURCC: &[u8; 4] = b"hvc1";

/// AAC, 44 kHz, 16 bit, stereo. FLV requires these flags for AAC whatever
/// the real format.
const AAC_TAG_HEADER: u8 = 0xAF;

/// G.711 A-law (7), 16 bit, mono.
const ALAW_TAG_HEADER: u8 = 0x72;

/// Builds FLV video and audio tag bodies.
pub struct FlvPacketizer {
    video_info: Option<VideoInfo>,
    audio_info: Option<AudioInfo>,
    video_config: Option<Bytes>,
    audio_config_sent: bool,
    base_pts_us: Option<u64>,
    last_timestamp: Option<u32>,
    force_increasing: bool,
}

impl Default for FlvPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvPacketizer {
    /// Create a packetizer without format information.
    pub fn new() -> Self {
        Self {
            video_info: None,
            audio_info: None,
            video_config: None,
            audio_config_sent: false,
            base_pts_us: None,
            last_timestamp: None,
            force_increasing: false,
        }
    }

    /// Make timestamps strictly increasing across both tracks. Some CDNs
    /// (Akamai) reject streams where audio and video timestamps interleave
    /// backwards.
    pub fn set_force_increasing_timestamps(&mut self, enabled: bool) {
        self.force_increasing = enabled;
    }

    /// Format information set so far.
    pub fn video_info(&self) -> Option<&VideoInfo> {
        self.video_info.as_ref()
    }

    /// Audio format set so far.
    pub fn audio_info(&self) -> Option<&AudioInfo> {
        self.audio_info.as_ref()
    }

    /// Milliseconds since the first unit of the connection.
    fn timestamp(&mut self, pts_us: u64) -> u32 {
        let base = *self.base_pts_us.get_or_insert(pts_us);
        let mut ts = (pts_us.saturating_sub(base) / 1000) as u32;
        if self.force_increasing {
            if let Some(last) = self.last_timestamp {
                if ts <= last {
                    ts = last.wrapping_add(1);
                }
            }
        }
        self.last_timestamp = Some(ts);
        ts
    }

    fn build_video_config(&mut self) {
        let Some(ref info) = self.video_info else {
            return;
        };
        self.video_config = match info.codec() {
            VideoCodec::H264 => nal::build_avc_decoder_config(&info.sps, &info.pps)
                .map(|record| avc_tag(&record, true, true)),
            VideoCodec::H265 => info.vps.as_ref().and_then(|vps| {
                nal::build_hevc_decoder_config(vps, &info.sps, &info.pps)
                    .map(|record| hevc_tag(&record, true, PACKET_TYPE_SEQUENCE_START))
            }),
        };
        if self.video_config.is_none() {
            debug!("Parameter sets rejected, video sequence header unavailable");
        }
    }
}

impl MediaPacketizer for FlvPacketizer {
    fn set_video_info(&mut self, info: &VideoInfo) {
        self.video_info = Some(info.clone());
        self.build_video_config();
    }

    fn set_audio_info(&mut self, info: &AudioInfo) {
        self.audio_info = Some(*info);
        self.audio_config_sent = false;
    }

    fn packetize_video(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        if unit.is_empty() {
            return Vec::new();
        }

        let codec = self
            .video_info
            .as_ref()
            .map(VideoInfo::codec)
            .unwrap_or_default();

        // Parameter sets may only arrive in band with the first key-frame.
        if self.video_config.is_none() && unit.is_keyframe() {
            if let Some(info) = nal::extract_video_info(&unit.data, codec) {
                debug!("Using in-band parameter sets");
                self.video_info = Some(info);
                self.build_video_config();
            }
        }
        let Some(config) = self.video_config.clone() else {
            trace!("No video sequence header yet, dropping frame");
            return Vec::new();
        };

        let nals: Vec<_> = nal::split_annex_b(&unit.data)
            .into_iter()
            .filter(|n| !n.is_empty() && !nal::is_parameter_set(codec, n))
            .collect();
        if nals.is_empty() {
            return Vec::new();
        }

        let timestamp = self.timestamp(unit.pts_us);
        let avcc = nal::to_avcc(&nals);
        let keyframe = unit.is_keyframe();
        let body = match codec {
            VideoCodec::H264 => avc_tag(&avcc, keyframe, false),
            VideoCodec::H265 => hevc_tag(&avcc, keyframe, PACKET_TYPE_CODED_FRAMES_X),
        };

        let mut frames = Vec::with_capacity(2);
        if keyframe {
            frames.push(WireFrame::new(config, timestamp, FrameKind::Config, Track::Video));
            frames.push(WireFrame::new(body, timestamp, FrameKind::KeyFrame, Track::Video));
        } else {
            frames.push(WireFrame::new(body, timestamp, FrameKind::Video, Track::Video));
        }
        frames
    }

    fn packetize_audio(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        if unit.is_empty() {
            return Vec::new();
        }
        let Some(info) = self.audio_info else {
            return Vec::new();
        };

        let timestamp = self.timestamp(unit.pts_us);
        let mut frames = Vec::with_capacity(2);

        match info.codec {
            AudioCodec::Aac => {
                if !self.audio_config_sent {
                    let mut header = BytesMut::with_capacity(4);
                    header.put_u8(AAC_TAG_HEADER);
                    header.put_u8(0x00);
                    header.put_slice(&audio_specific_config(&info));
                    frames.push(WireFrame::new(
                        header.freeze(),
                        timestamp,
                        FrameKind::Config,
                        Track::Audio,
                    ));
                    self.audio_config_sent = true;
                }
                let mut body = BytesMut::with_capacity(2 + unit.data.len());
                body.put_u8(AAC_TAG_HEADER);
                body.put_u8(0x01);
                body.put_slice(&unit.data);
                frames.push(WireFrame::new(
                    body.freeze(),
                    timestamp,
                    FrameKind::Audio,
                    Track::Audio,
                ));
            }
            AudioCodec::G711 => {
                let mut body = BytesMut::with_capacity(1 + unit.data.len());
                body.put_u8(ALAW_TAG_HEADER);
                body.put_slice(&unit.data);
                frames.push(WireFrame::new(
                    body.freeze(),
                    timestamp,
                    FrameKind::Audio,
                    Track::Audio,
                ));
            }
        }

        frames
    }

    fn reset(&mut self) {
        self.base_pts_us = None;
        self.last_timestamp = None;
        self.audio_config_sent = false;
    }
}

/// FLV video tag body for H.264.
fn avc_tag(data: &[u8], keyframe: bool, sequence_header: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    let frame_type = if keyframe {
        FRAME_TYPE_KEY
    } else {
        FRAME_TYPE_INTER
    };
    buf.put_u8(frame_type | AVC_CODEC_ID);
    buf.put_u8(if sequence_header { 0x00 } else { 0x01 });
    // composition time, zero without B-frames
    buf.put_slice(&[0, 0, 0]);
    buf.put_slice(data);
    buf.freeze()
}

/// Enhanced RTMP video tag body for H.265.
fn hevc_tag(data: &[u8], keyframe: bool, packet_type: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    let frame_type = if keyframe {
        FRAME_TYPE_KEY
    } else {
        FRAME_TYPE_INTER
    };
    buf.put_u8(EX_HEADER | frame_type | packet_type);
    buf.put_slice(HEVC_FOURCC);
    buf.put_slice(data);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_info() -> VideoInfo {
        VideoInfo::new(
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E, 0xAB]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
            None,
        )
    }

    #[test]
    fn test_keyframe_preceded_by_sequence_header() {
        let mut packetizer = FlvPacketizer::new();
        packetizer.set_video_info(&h264_info());

        let frames = packetizer.packetize_video(&EncodedUnit::video(
            vec![0u8, 0, 0, 1, 0x65, 0x88, 0x84],
            5_000_000,
            true,
        ));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Config);
        assert_eq!(&frames[0].data[..2], &[0x17, 0x00]);
        assert_eq!(frames[0].data[5], 0x01); // configurationVersion
        assert_eq!(frames[1].kind, FrameKind::KeyFrame);
        assert_eq!(
            frames[1].data.as_ref(),
            &[0x17, 0x01, 0, 0, 0, 0, 0, 0, 3, 0x65, 0x88, 0x84]
        );
        assert_eq!(frames[1].timestamp, 0);
    }

    #[test]
    fn test_delta_frame_and_relative_timestamp() {
        let mut packetizer = FlvPacketizer::new();
        packetizer.set_video_info(&h264_info());
        packetizer.packetize_video(&EncodedUnit::video(vec![0u8, 0, 1, 0x65, 1], 1_000_000, true));

        let frames =
            packetizer.packetize_video(&EncodedUnit::video(vec![0u8, 0, 1, 0x41, 2], 1_040_000, false));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data[0], 0x27);
        assert_eq!(frames[0].timestamp, 40);
    }

    #[test]
    fn test_video_dropped_without_sequence_header() {
        let mut packetizer = FlvPacketizer::new();
        let frames =
            packetizer.packetize_video(&EncodedUnit::video(vec![0u8, 0, 1, 0x41, 2], 0, false));
        assert!(frames.is_empty());
    }

    #[test]
    fn test_in_band_parameter_sets() {
        let mut packetizer = FlvPacketizer::new();
        let frames = packetizer.packetize_video(&EncodedUnit::video(
            vec![
                0u8, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65,
                0x88,
            ],
            0,
            true,
        ));
        assert_eq!(frames.len(), 2);
        assert!(packetizer.video_info().is_some());
    }

    #[test]
    fn test_hevc_enhanced_tags() {
        let mut packetizer = FlvPacketizer::new();
        packetizer.set_video_info(&VideoInfo::new(
            Bytes::from_static(&[
                0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x00, 0x90, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x5D, 0xA0,
            ]),
            Bytes::from_static(&[0x44, 0x01, 0xC1]),
            Some(Bytes::from_static(&[0x40, 0x01, 0x0C])),
        ));

        let frames =
            packetizer.packetize_video(&EncodedUnit::video(vec![0u8, 0, 1, 0x26, 0x01, 0xAA], 0, true));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data[0], 0x90);
        assert_eq!(&frames[0].data[1..5], b"hvc1");
        assert_eq!(frames[1].data[0], 0x93);
    }

    #[test]
    fn test_aac_sequence_header_once() {
        let mut packetizer = FlvPacketizer::new();
        packetizer.set_audio_info(&AudioInfo::aac(44_100, true));

        let first = packetizer.packetize_audio(&EncodedUnit::audio(vec![0x21u8, 0x00], 0));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].data.as_ref(), &[0xAF, 0x00, 0x12, 0x10]);
        assert_eq!(first[1].data.as_ref(), &[0xAF, 0x01, 0x21, 0x00]);

        let second = packetizer.packetize_audio(&EncodedUnit::audio(vec![0x21u8], 23_000));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].timestamp, 23);

        packetizer.reset();
        assert_eq!(
            packetizer
                .packetize_audio(&EncodedUnit::audio(vec![0x21u8], 50_000))
                .len(),
            2
        );
    }

    #[test]
    fn test_g711_tag() {
        let mut packetizer = FlvPacketizer::new();
        packetizer.set_audio_info(&AudioInfo {
            sample_rate: 8000,
            channels: 1,
            codec: AudioCodec::G711,
        });
        let frames = packetizer.packetize_audio(&EncodedUnit::audio(vec![0xD5u8; 4], 0));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data[0], 0x72);
    }

    #[test]
    fn test_force_increasing_timestamps() {
        let mut packetizer = FlvPacketizer::new();
        packetizer.set_force_increasing_timestamps(true);
        packetizer.set_audio_info(&AudioInfo::aac(48_000, true));

        let a = packetizer.packetize_audio(&EncodedUnit::audio(vec![1u8], 10_000));
        let b = packetizer.packetize_audio(&EncodedUnit::audio(vec![1u8], 10_500));
        let c = packetizer.packetize_audio(&EncodedUnit::audio(vec![1u8], 9_000));
        assert_eq!(a.last().unwrap().timestamp, 0);
        assert_eq!(b[0].timestamp, 1);
        assert_eq!(c[0].timestamp, 2);
    }
}
