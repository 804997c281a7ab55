//! MPEG-TS multiplexing (ISO 13818-1) for the SRT client.
//!
//! One program with up to two elementary streams. PAT and PMT are repeated
//! ahead of every key-frame, and every [`PSI_INTERVAL`] units when the
//! stream has no video. Output is grouped into 1316-byte payloads, seven
//! 188-byte TS packets each, the usual SRT live payload.

use bytes::{BufMut, Bytes, BytesMut};
use livecast_ipc::{AudioCodec, AudioInfo, EncodedUnit, VideoCodec, VideoInfo};
use tracing::debug;

use super::aac::adts_header;
use super::MediaPacketizer;
use crate::nal;
use crate::wire::{FrameKind, Track, WireFrame};

/// Size of one transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;

/// TS packets per SRT payload.
pub const TS_PACKETS_PER_PAYLOAD: usize = 7;

/// Units between table repeats when no key-frame forces one.
pub const PSI_INTERVAL: u32 = 40;

const SYNC_BYTE: u8 = 0x47;
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;

const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;

const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_H265: u8 = 0x24;
const STREAM_TYPE_AAC: u8 = 0x0F;

const STREAM_ID_VIDEO: u8 = 0xE0;
const STREAM_ID_AUDIO: u8 = 0xC0;

const PTS_MASK: u64 = (1 << 33) - 1;

#[derive(Debug, Default)]
struct Continuity {
    pat: u8,
    pmt: u8,
    video: u8,
    audio: u8,
}

impl Continuity {
    fn next(&mut self, pid: u16) -> u8 {
        let counter = match pid {
            PAT_PID => &mut self.pat,
            PMT_PID => &mut self.pmt,
            VIDEO_PID => &mut self.video,
            _ => &mut self.audio,
        };
        let value = *counter;
        *counter = (*counter + 1) & 0x0F;
        value
    }
}

/// Muxes video and audio access units into MPEG-TS.
pub struct TsPacketizer {
    video_info: Option<VideoInfo>,
    audio_info: Option<AudioInfo>,
    continuity: Continuity,
    units_since_psi: u32,
    psi_sent: bool,
}

impl Default for TsPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsPacketizer {
    /// Create a muxer without streams.
    pub fn new() -> Self {
        Self {
            video_info: None,
            audio_info: None,
            continuity: Continuity::default(),
            units_since_psi: 0,
            psi_sent: false,
        }
    }

    fn video_stream_type(&self) -> Option<u8> {
        self.video_info.as_ref().map(|info| match info.codec() {
            VideoCodec::H264 => STREAM_TYPE_H264,
            VideoCodec::H265 => STREAM_TYPE_H265,
        })
    }

    fn audio_stream_type(&self) -> Option<u8> {
        match self.audio_info {
            Some(AudioInfo {
                codec: AudioCodec::Aac,
                ..
            }) => Some(STREAM_TYPE_AAC),
            _ => None,
        }
    }

    fn pcr_pid(&self) -> u16 {
        if self.video_info.is_some() {
            VIDEO_PID
        } else {
            AUDIO_PID
        }
    }

    /// PAT and PMT, when due.
    fn tables(&mut self, keyframe: bool, timestamp: u32) -> Vec<WireFrame> {
        let due = !self.psi_sent || keyframe || self.units_since_psi >= PSI_INTERVAL;
        self.units_since_psi += 1;
        if !due {
            return Vec::new();
        }
        self.psi_sent = true;
        self.units_since_psi = 0;

        let mut out = BytesMut::with_capacity(2 * TS_PACKET_SIZE);
        let pat = self.pat_section();
        self.write_packets(&mut out, PAT_PID, &pat, None, false);
        let pmt = self.pmt_section();
        self.write_packets(&mut out, PMT_PID, &pmt, None, false);
        group(out.freeze(), timestamp, FrameKind::Config, Track::Video)
    }

    fn pat_section(&self) -> Vec<u8> {
        let mut section = vec![0x00];
        // table_id, section_length 13
        section.extend_from_slice(&[0x00, 0xB0, 13]);
        // transport_stream_id, version 0 current, section numbers
        section.extend_from_slice(&[0x00, 0x01, 0xC1, 0x00, 0x00]);
        // program 1 → PMT
        section.extend_from_slice(&[0x00, 0x01]);
        section.extend_from_slice(&(0xE000 | PMT_PID).to_be_bytes());
        let crc = crc32_mpeg2(&section[1..]);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    fn pmt_section(&self) -> Vec<u8> {
        let mut streams = Vec::new();
        if let Some(stream_type) = self.video_stream_type() {
            streams.push((stream_type, VIDEO_PID));
        }
        if let Some(stream_type) = self.audio_stream_type() {
            streams.push((stream_type, AUDIO_PID));
        }

        let section_length = 13 + 5 * streams.len() as u16;
        let mut section = vec![0x00, 0x02];
        section.extend_from_slice(&(0xB000 | section_length).to_be_bytes());
        section.extend_from_slice(&[0x00, 0x01, 0xC1, 0x00, 0x00]);
        section.extend_from_slice(&(0xE000 | self.pcr_pid()).to_be_bytes());
        // no program descriptors
        section.extend_from_slice(&[0xF0, 0x00]);
        for (stream_type, pid) in streams {
            section.push(stream_type);
            section.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            section.extend_from_slice(&[0xF0, 0x00]);
        }
        let crc = crc32_mpeg2(&section[1..]);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    /// Split `payload` over TS packets on `pid`. The first packet starts the
    /// unit and carries the PCR and random access flag when given.
    fn write_packets(
        &mut self,
        out: &mut BytesMut,
        pid: u16,
        payload: &[u8],
        pcr: Option<u64>,
        random_access: bool,
    ) {
        let mut offset = 0;
        let mut first = true;

        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let flags_needed = first && (pcr.is_some() || random_access);
            let min_adaptation = match (flags_needed, first.then_some(pcr).flatten()) {
                (true, Some(_)) => 8,
                (true, None) => 2,
                _ => 0,
            };
            let chunk = remaining.min(TS_PAYLOAD_SIZE - min_adaptation);
            let adaptation_len = TS_PAYLOAD_SIZE - chunk;

            out.put_u8(SYNC_BYTE);
            let start = if first { 0x40 } else { 0x00 };
            out.put_u8(start | ((pid >> 8) as u8 & 0x1F));
            out.put_u8(pid as u8);
            let control = if adaptation_len > 0 { 0x30 } else { 0x10 };
            out.put_u8(control | self.continuity.next(pid));

            if adaptation_len > 0 {
                out.put_u8((adaptation_len - 1) as u8);
                if adaptation_len > 1 {
                    let mut flags = 0u8;
                    if first && random_access {
                        flags |= 0x40;
                    }
                    let pcr = if first { pcr } else { None };
                    if pcr.is_some() {
                        flags |= 0x10;
                    }
                    out.put_u8(flags);
                    let mut written = 2;
                    if let Some(base) = pcr {
                        out.put_slice(&encode_pcr(base));
                        written += 6;
                    }
                    out.put_bytes(0xFF, adaptation_len - written);
                }
            }

            out.put_slice(&payload[offset..offset + chunk]);
            offset += chunk;
            first = false;
        }
    }
}

impl MediaPacketizer for TsPacketizer {
    fn set_video_info(&mut self, info: &VideoInfo) {
        self.video_info = Some(info.clone());
        self.psi_sent = false;
    }

    fn set_audio_info(&mut self, info: &AudioInfo) {
        if info.codec != AudioCodec::Aac {
            debug!(codec = ?info.codec, "Audio codec not carried over MPEG-TS, audio disabled");
        }
        self.audio_info = Some(*info);
        self.psi_sent = false;
    }

    fn packetize_video(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        if unit.is_empty() {
            return Vec::new();
        }
        let Some(ref info) = self.video_info else {
            return Vec::new();
        };
        let codec = info.codec();

        let mut es = BytesMut::with_capacity(unit.data.len() + 64);
        match codec {
            VideoCodec::H264 => es.put_slice(&[0, 0, 0, 1, 0x09, 0xF0]),
            VideoCodec::H265 => es.put_slice(&[0, 0, 0, 1, 0x46, 0x01, 0x50]),
        }
        let nals = nal::split_annex_b(&unit.data);
        let has_parameter_sets = nals
            .iter()
            .any(|n| nal::is_parameter_set(codec, n) && !is_aud(codec, n));
        if unit.is_keyframe() && !has_parameter_sets {
            es.put_slice(&nal::parameter_sets_annex_b(info));
        }
        for nal in nals.iter().filter(|n| !n.is_empty() && !is_aud(codec, n)) {
            es.put_slice(&[0, 0, 0, 1]);
            es.put_slice(nal);
        }

        let pts = pts_90k(unit.pts_us);
        let timestamp = pts as u32;
        let keyframe = unit.is_keyframe();
        let mut frames = self.tables(keyframe, timestamp);

        let packet = pes(STREAM_ID_VIDEO, pts, &es, false);
        let mut out = BytesMut::with_capacity(packet.len() / TS_PAYLOAD_SIZE * TS_PACKET_SIZE + 376);
        self.write_packets(&mut out, VIDEO_PID, &packet, Some(pts), keyframe);

        let kind = if keyframe {
            FrameKind::KeyFrame
        } else {
            FrameKind::Video
        };
        frames.extend(group(out.freeze(), timestamp, kind, Track::Video));
        frames
    }

    fn packetize_audio(&mut self, unit: &EncodedUnit) -> Vec<WireFrame> {
        if unit.is_empty() || self.audio_stream_type().is_none() {
            return Vec::new();
        }
        let Some(info) = self.audio_info else {
            return Vec::new();
        };

        let mut es = Vec::with_capacity(unit.data.len() + 7);
        let has_adts = unit.data.len() > 1 && unit.data[0] == 0xFF && unit.data[1] & 0xF0 == 0xF0;
        if !has_adts {
            es.extend_from_slice(&adts_header(&info, unit.data.len()));
        }
        es.extend_from_slice(&unit.data);

        let pts = pts_90k(unit.pts_us);
        let timestamp = pts as u32;
        let mut frames = if self.video_info.is_none() {
            self.tables(false, timestamp)
        } else {
            Vec::new()
        };

        let pcr = self.video_info.is_none().then_some(pts);
        let packet = pes(STREAM_ID_AUDIO, pts, &es, true);
        let mut out = BytesMut::with_capacity(2 * TS_PACKET_SIZE);
        self.write_packets(&mut out, AUDIO_PID, &packet, pcr, false);
        frames.extend(group(out.freeze(), timestamp, FrameKind::Audio, Track::Audio));
        frames
    }

    fn reset(&mut self) {
        self.continuity = Continuity::default();
        self.units_since_psi = 0;
        self.psi_sent = false;
    }
}

/// PES packet with a PTS. Video PES packets are left unbounded.
fn pes(stream_id: u8, pts: u64, data: &[u8], bounded: bool) -> Vec<u8> {
    let mut pes = Vec::with_capacity(14 + data.len());
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    let length = 8 + data.len();
    let length = if bounded && length <= u16::MAX as usize {
        length as u16
    } else {
        0
    };
    pes.extend_from_slice(&length.to_be_bytes());
    // marker bits, PTS only, 5 header bytes
    pes.extend_from_slice(&[0x80, 0x80, 0x05]);
    pes.extend_from_slice(&encode_pts(pts));
    pes.extend_from_slice(data);
    pes
}

fn is_aud(codec: VideoCodec, nal: &[u8]) -> bool {
    nal.first().is_some_and(|&h| {
        let t = nal::nal_type(codec, h);
        match codec {
            VideoCodec::H264 => t == nal::h264::AUD,
            VideoCodec::H265 => t == nal::h265::AUD,
        }
    })
}

fn pts_90k(pts_us: u64) -> u64 {
    (pts_us * 9 / 100) & PTS_MASK
}

fn encode_pts(pts: u64) -> [u8; 5] {
    [
        0x21 | ((pts >> 29) as u8 & 0x0E),
        (pts >> 22) as u8,
        ((pts >> 14) as u8 & 0xFE) | 0x01,
        (pts >> 7) as u8,
        ((pts << 1) as u8 & 0xFE) | 0x01,
    ]
}

fn encode_pcr(base: u64) -> [u8; 6] {
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        ((base & 0x01) as u8) << 7 | 0x7E,
        0x00,
    ]
}

/// Group TS packets into SRT-sized payloads.
fn group(data: Bytes, timestamp: u32, kind: FrameKind, track: Track) -> Vec<WireFrame> {
    let size = TS_PACKET_SIZE * TS_PACKETS_PER_PAYLOAD;
    (0..data.len())
        .step_by(size)
        .map(|start| {
            let end = (start + size).min(data.len());
            WireFrame::new(data.slice(start..end), timestamp, kind, track)
        })
        .collect()
}

/// CRC-32/MPEG-2: polynomial 0x04C11DB7, no reflection, no final xor.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}
