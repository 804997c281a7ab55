//! Access units read from an Annex B elementary stream file.

use bytes::{BufMut, Bytes, BytesMut};
use livecast_ipc::VideoCodec;
use livecast_transport::nal::{self, h264, h265};

/// One picture with its leading parameter sets and SEI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Annex B data with 4-byte start codes.
    pub data: Bytes,
    pub is_keyframe: bool,
}

fn is_vcl(codec: VideoCodec, nal: &[u8]) -> bool {
    let Some(&header) = nal.first() else {
        return false;
    };
    let t = nal::nal_type(codec, header);
    match codec {
        VideoCodec::H264 => (1..=5).contains(&t),
        VideoCodec::H265 => t < 32,
    }
}

/// Non-VCL units that may only appear before the first slice of a picture.
fn opens_access_unit(codec: VideoCodec, nal: &[u8]) -> bool {
    let Some(&header) = nal.first() else {
        return false;
    };
    let t = nal::nal_type(codec, header);
    match codec {
        VideoCodec::H264 => matches!(t, h264::SEI | h264::SPS | h264::PPS | h264::AUD),
        VideoCodec::H265 => matches!(t, h265::VPS | h265::SPS | h265::PPS | h265::AUD | 39),
    }
}

/// First slice of a picture: `first_mb_in_slice == 0` for H.264,
/// `first_slice_segment_in_pic_flag` for H.265.
fn is_first_slice(codec: VideoCodec, nal: &[u8]) -> bool {
    match codec {
        VideoCodec::H264 => nal.get(1).is_some_and(|b| b & 0x80 != 0),
        VideoCodec::H265 => nal.get(2).is_some_and(|b| b & 0x80 != 0),
    }
}

/// Group the NAL units of `stream` into access units.
pub fn access_units(stream: &Bytes, codec: VideoCodec) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    let mut current = BytesMut::new();
    let mut has_slice = false;
    let mut is_keyframe = false;

    for unit in nal::split_annex_b(stream) {
        if unit.is_empty() {
            continue;
        }
        let vcl = is_vcl(codec, &unit);
        let boundary = has_slice
            && (opens_access_unit(codec, &unit) || (vcl && is_first_slice(codec, &unit)));
        if boundary {
            units.push(AccessUnit {
                data: current.split().freeze(),
                is_keyframe,
            });
            has_slice = false;
            is_keyframe = false;
        }

        current.put_slice(&[0, 0, 0, 1]);
        current.put_slice(&unit);
        has_slice |= vcl;
        is_keyframe |= nal::is_keyframe_nal(codec, &unit);
    }

    if has_slice {
        units.push(AccessUnit {
            data: current.freeze(),
            is_keyframe,
        });
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annex_b(nals: &[&[u8]]) -> Bytes {
        let mut data = Vec::new();
        for nal in nals {
            data.extend_from_slice(&[0, 0, 1]);
            data.extend_from_slice(nal);
        }
        Bytes::from(data)
    }

    #[test]
    fn test_h264_access_units() {
        let stream = annex_b(&[
            &[0x67, 0x42, 0xC0, 0x1E],
            &[0x68, 0xCE, 0x3C, 0x80],
            &[0x65, 0x88, 0x84],
            &[0x41, 0x9A, 0x02],
            &[0x41, 0x9A, 0x04],
        ]);

        let units = access_units(&stream, VideoCodec::H264);
        assert_eq!(units.len(), 3);
        assert!(units[0].is_keyframe);
        assert!(!units[1].is_keyframe);
        assert_eq!(
            &units[0].data[..],
            &[
                0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1E, 0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80, 0, 0, 0,
                1, 0x65, 0x88, 0x84
            ]
        );
        assert_eq!(&units[2].data[..], &[0, 0, 0, 1, 0x41, 0x9A, 0x04]);
    }

    #[test]
    fn test_h264_slices_of_one_picture_stay_together() {
        // Second slice has first_mb_in_slice != 0.
        let stream = annex_b(&[&[0x65, 0x88, 0x84], &[0x65, 0x40, 0x12], &[0x41, 0x9A]]);

        let units = access_units(&stream, VideoCodec::H264);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].data.len(), 14);
    }

    #[test]
    fn test_h265_access_units() {
        let stream = annex_b(&[
            &[0x40, 0x01, 0x0C],
            &[0x42, 0x01, 0x01],
            &[0x44, 0x01, 0xC1],
            &[0x26, 0x01, 0xAF],
            &[0x02, 0x01, 0xD0],
        ]);

        let units = access_units(&stream, VideoCodec::H265);
        assert_eq!(units.len(), 2);
        assert!(units[0].is_keyframe);
        assert!(!units[1].is_keyframe);
    }

    #[test]
    fn test_trailing_parameter_sets_are_dropped() {
        let stream = annex_b(&[&[0x65, 0x88], &[0x67, 0x42]]);
        let units = access_units(&stream, VideoCodec::H264);
        assert_eq!(units.len(), 1);
        assert!(access_units(&Bytes::new(), VideoCodec::H264).is_empty());
    }
}
