//! NAL unit parsing and decoder configuration records.
//!
//! Encoders hand over video in **Annex B** form, with start codes
//! (0x000001 or 0x00000001) separating NAL units. RTMP wants **AVCC**
//! (4-byte length prefixes) plus a decoder configuration record, RTP wants
//! bare NAL units, and MPEG-TS keeps Annex B.

use bytes::{BufMut, Bytes, BytesMut};
use livecast_ipc::{VideoCodec, VideoInfo};
use tracing::debug;

/// H.264 NAL unit types the packetizers care about.
pub mod h264 {
    pub const IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

/// H.265 NAL unit types the packetizers care about.
pub mod h265 {
    pub const IDR_W_RADL: u8 = 19;
    pub const IDR_N_LP: u8 = 20;
    pub const CRA: u8 = 21;
    pub const VPS: u8 = 32;
    pub const SPS: u8 = 33;
    pub const PPS: u8 = 34;
    pub const AUD: u8 = 35;
}

/// NAL unit type from the first header byte.
pub fn nal_type(codec: VideoCodec, header: u8) -> u8 {
    match codec {
        VideoCodec::H264 => header & 0x1F,
        VideoCodec::H265 => (header >> 1) & 0x3F,
    }
}

/// Returns true for parameter sets and access unit delimiters.
pub fn is_parameter_set(codec: VideoCodec, nal: &[u8]) -> bool {
    let Some(&header) = nal.first() else {
        return false;
    };
    let t = nal_type(codec, header);
    match codec {
        VideoCodec::H264 => matches!(t, h264::SPS | h264::PPS | h264::AUD),
        VideoCodec::H265 => matches!(t, h265::VPS | h265::SPS | h265::PPS | h265::AUD),
    }
}

/// Returns true for NAL units that start a random access point.
pub fn is_keyframe_nal(codec: VideoCodec, nal: &[u8]) -> bool {
    let Some(&header) = nal.first() else {
        return false;
    };
    let t = nal_type(codec, header);
    match codec {
        VideoCodec::H264 => t == h264::IDR,
        VideoCodec::H265 => matches!(t, h265::IDR_W_RADL | h265::IDR_N_LP | h265::CRA),
    }
}

/// Split an Annex B byte stream into NAL units, without start codes.
///
/// Data before the first start code is treated as a single NAL unit, so a
/// buffer holding one bare NAL unit is returned as is.
pub fn split_annex_b(data: &Bytes) -> Vec<Bytes> {
    let mut nals = Vec::new();
    let len = data.len();
    let mut start = 0;
    let mut i = 0;

    while i + 2 < len {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let mut end = i;
            if end > start && data[end - 1] == 0 {
                end -= 1;
            }
            if end > start {
                nals.push(data.slice(start..end));
            }
            i += 3;
            start = i;
        } else {
            i += 1;
        }
    }

    if start < len {
        nals.push(data.slice(start..len));
    }

    nals
}

/// Convert NAL units to AVCC format with 4-byte length prefixes.
pub fn to_avcc<'a>(nals: impl IntoIterator<Item = &'a Bytes>) -> Bytes {
    let mut buf = BytesMut::new();
    for nal in nals {
        buf.put_u32(nal.len() as u32);
        buf.put_slice(nal);
    }
    buf.freeze()
}

/// Drop the emulation prevention bytes (0x000003 → 0x0000).
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// Find the parameter sets in an Annex B buffer, typically the encoder's
/// first output.
pub fn extract_video_info(annex_b: &Bytes, codec: VideoCodec) -> Option<VideoInfo> {
    let mut vps = None;
    let mut sps = None;
    let mut pps = None;

    for nal in split_annex_b(annex_b) {
        let Some(&header) = nal.first() else {
            continue;
        };
        match (codec, nal_type(codec, header)) {
            (VideoCodec::H264, h264::SPS) | (VideoCodec::H265, h265::SPS) => {
                debug!(len = nal.len(), "Found SPS NAL unit");
                sps = Some(nal);
            }
            (VideoCodec::H264, h264::PPS) | (VideoCodec::H265, h265::PPS) => {
                debug!(len = nal.len(), "Found PPS NAL unit");
                pps = Some(nal);
            }
            (VideoCodec::H265, h265::VPS) => {
                debug!(len = nal.len(), "Found VPS NAL unit");
                vps = Some(nal);
            }
            _ => {}
        }
    }

    match (codec, sps, pps, vps) {
        (VideoCodec::H264, Some(s), Some(p), _) => Some(VideoInfo::new(s, p, None)),
        (VideoCodec::H265, Some(s), Some(p), Some(v)) => Some(VideoInfo::new(s, p, Some(v))),
        _ => None,
    }
}

/// Build an AVC Decoder Configuration Record (ISO 14496-15) from SPS and PPS.
///
/// This is the sequence header RTMP sends before any H.264 frame.
pub fn build_avc_decoder_config(sps: &[u8], pps: &[u8]) -> Option<Bytes> {
    if sps.len() < 4 {
        debug!("SPS too short: {} bytes", sps.len());
        return None;
    }

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());

    // configurationVersion
    buf.put_u8(0x01);

    // profile_idc, constraint flags, level_idc
    buf.put_u8(sps[1]);
    buf.put_u8(sps[2]);
    buf.put_u8(sps[3]);

    // 4-byte NAL length prefix, reserved bits set
    buf.put_u8(0xFF);

    // one SPS, reserved bits set
    buf.put_u8(0xE1);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);

    buf.put_u8(0x01);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);

    Some(buf.freeze())
}

/// Build an HEVC Decoder Configuration Record (ISO 14496-15 §8.3.3).
///
/// The profile, tier and level fields are copied from the SPS
/// `profile_tier_level` structure.
pub fn build_hevc_decoder_config(vps: &[u8], sps: &[u8], pps: &[u8]) -> Option<Bytes> {
    let rbsp = remove_emulation_prevention(sps);
    // 2-byte NAL header, 1 byte of ids, then 12 bytes of general profile data.
    if rbsp.len() < 15 {
        debug!("SPS too short: {} bytes", sps.len());
        return None;
    }
    let ptl = &rbsp[3..15];

    let mut buf = BytesMut::with_capacity(38 + vps.len() + sps.len() + pps.len());
    buf.put_u8(0x01);
    // profile_space, tier, profile_idc
    buf.put_u8(ptl[0]);
    // compatibility flags
    buf.put_slice(&ptl[1..5]);
    // constraint indicator flags
    buf.put_slice(&ptl[5..11]);
    // level_idc
    buf.put_u8(ptl[11]);
    // min_spatial_segmentation_idc
    buf.put_u16(0xF000);
    // parallelismType
    buf.put_u8(0xFC);
    // chroma_format_idc 4:2:0
    buf.put_u8(0xFD);
    // bit depth luma and chroma, 8 bits
    buf.put_u8(0xF8);
    buf.put_u8(0xF8);
    // avgFrameRate
    buf.put_u16(0);
    // constantFrameRate 0, one temporal layer, nested, 4-byte lengths
    buf.put_u8(0x0F);

    buf.put_u8(3);
    for (nal_type, nal) in [(h265::VPS, vps), (h265::SPS, sps), (h265::PPS, pps)] {
        buf.put_u8(0x80 | nal_type);
        buf.put_u16(1);
        buf.put_u16(nal.len() as u16);
        buf.put_slice(nal);
    }

    Some(buf.freeze())
}

/// Annex B rendition of the parameter sets, prepended to key-frames where
/// the container needs them in band.
pub fn parameter_sets_annex_b(info: &VideoInfo) -> Bytes {
    let mut buf = BytesMut::new();
    let sets = info
        .vps
        .iter()
        .chain(std::iter::once(&info.sps))
        .chain(std::iter::once(&info.pps));
    for nal in sets {
        buf.put_slice(&[0, 0, 0, 1]);
        buf.put_slice(nal);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_annex_b_3byte_start_code() {
        let data = Bytes::from_static(&[0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E]);
        let nals = split_annex_b(&data);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].as_ref(), &[0x67, 0x42, 0x00, 0x1E]);
    }

    #[test]
    fn test_split_annex_b_multiple_nals() {
        let data = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
            0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80, // PPS
            0x00, 0x00, 0x01, 0x65, 0x88, // IDR
        ]);
        let nals = split_annex_b(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nal_type(VideoCodec::H264, nals[0][0]), h264::SPS);
        assert_eq!(nal_type(VideoCodec::H264, nals[1][0]), h264::PPS);
        assert_eq!(nals[2].as_ref(), &[0x65, 0x88]);
    }

    #[test]
    fn test_split_bare_nal() {
        let data = Bytes::from_static(&[0x41, 0x9A, 0x00]);
        assert_eq!(split_annex_b(&data), vec![data.clone()]);
    }

    #[test]
    fn test_to_avcc() {
        let nals = [Bytes::from_static(&[0x65, 0x88, 0x84])];
        let avcc = to_avcc(&nals);
        assert_eq!(avcc.as_ref(), &[0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_h265_types() {
        // VPS header 0x40 0x01, IDR_W_RADL header 0x26 0x01
        assert_eq!(nal_type(VideoCodec::H265, 0x40), h265::VPS);
        assert!(is_keyframe_nal(VideoCodec::H265, &[0x26, 0x01]));
        assert!(is_parameter_set(VideoCodec::H265, &[0x42, 0x01]));
        assert!(!is_keyframe_nal(VideoCodec::H264, &[0x41]));
    }

    #[test]
    fn test_remove_emulation_prevention() {
        assert_eq!(
            remove_emulation_prevention(&[0x00, 0x00, 0x03, 0x01, 0x05]),
            vec![0x00, 0x00, 0x01, 0x05]
        );
    }

    #[test]
    fn test_build_avc_decoder_config() {
        let sps = [0x67, 0x42, 0x00, 0x1E, 0xAB, 0xCD];
        let pps = [0x68, 0xCE, 0x3C, 0x80];

        let config = build_avc_decoder_config(&sps, &pps).unwrap();

        assert_eq!(config[0], 0x01);
        assert_eq!(config[1], 0x42);
        assert_eq!(config[3], 0x1E);
        assert_eq!(config[4], 0xFF);
        assert_eq!(config[5], 0xE1);
        assert_eq!(config.len(), 11 + sps.len() + pps.len());
    }

    #[test]
    fn test_build_hevc_decoder_config() {
        let vps = [0x40, 0x01, 0x0C];
        let sps = [
            0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x00, 0x90, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x5D, 0xA0,
        ];
        let pps = [0x44, 0x01, 0xC1];
        let config = build_hevc_decoder_config(&vps, &sps, &pps).unwrap();

        assert_eq!(config[0], 0x01);
        assert_eq!(config[1], 0x01); // main profile
        assert_eq!(config[12], 0x5D); // level 3.1
        assert_eq!(config[22], 3);
        assert_eq!(config[23], 0x80 | h265::VPS);
    }

    #[test]
    fn test_extract_video_info() {
        let data = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, 0x00, 0x00, 0x00, 0x01, 0x68, 0xCE,
        ]);
        let info = extract_video_info(&data, VideoCodec::H264).unwrap();
        assert_eq!(info.sps.as_ref(), &[0x67, 0x42, 0x00, 0x1E]);
        assert_eq!(info.pps.as_ref(), &[0x68, 0xCE]);
        assert!(extract_video_info(&data, VideoCodec::H265).is_none());
    }
}
