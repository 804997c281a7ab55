//! Session description sent with ANNOUNCE.

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use livecast_ipc::{AudioCodec, AudioInfo, VideoCodec, VideoInfo};

use crate::packetizer::{audio_specific_config, PAYLOAD_TYPE_AAC, PAYLOAD_TYPE_PCMA, PAYLOAD_TYPE_VIDEO, VIDEO_CLOCK_RATE};

/// Control path of the video track.
pub const VIDEO_TRACK: u8 = 0;

/// Control path of the audio track.
pub const AUDIO_TRACK: u8 = 1;

/// Build the SDP describing the tracks that will be recorded.
pub fn session_description(
    host: &str,
    video: Option<&VideoInfo>,
    audio: Option<&AudioInfo>,
) -> String {
    let address_type = if host.contains(':') { "IP6" } else { "IP4" };
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    let _ = write!(sdp, "o=- 0 0 IN {} 127.0.0.1\r\n", address_type);
    sdp.push_str("s=livecast\r\n");
    sdp.push_str("i=N/A\r\n");
    let _ = write!(sdp, "c=IN {} {}\r\n", address_type, host);
    sdp.push_str("t=0 0\r\n");
    sdp.push_str("a=recvonly\r\n");

    if let Some(info) = video {
        video_media(&mut sdp, info);
    }
    if let Some(info) = audio {
        audio_media(&mut sdp, info);
    }
    sdp
}

fn video_media(sdp: &mut String, info: &VideoInfo) {
    let pt = PAYLOAD_TYPE_VIDEO;
    let _ = write!(sdp, "m=video 0 RTP/AVP {}\r\n", pt);
    match info.codec() {
        VideoCodec::H264 => {
            let _ = write!(sdp, "a=rtpmap:{} H264/{}\r\n", pt, VIDEO_CLOCK_RATE);
            let _ = write!(
                sdp,
                "a=fmtp:{} packetization-mode=1;sprop-parameter-sets={},{}",
                pt,
                STANDARD.encode(&info.sps),
                STANDARD.encode(&info.pps)
            );
            if info.sps.len() >= 4 {
                let _ = write!(
                    sdp,
                    ";profile-level-id={:02X}{:02X}{:02X}",
                    info.sps[1], info.sps[2], info.sps[3]
                );
            }
            sdp.push_str("\r\n");
        }
        VideoCodec::H265 => {
            let _ = write!(sdp, "a=rtpmap:{} H265/{}\r\n", pt, VIDEO_CLOCK_RATE);
            let vps = info.vps.as_ref().map(|v| STANDARD.encode(v)).unwrap_or_default();
            let _ = write!(
                sdp,
                "a=fmtp:{} sprop-vps={};sprop-sps={};sprop-pps={}\r\n",
                pt,
                vps,
                STANDARD.encode(&info.sps),
                STANDARD.encode(&info.pps)
            );
        }
    }
    let _ = write!(sdp, "a=control:streamid={}\r\n", VIDEO_TRACK);
}

fn audio_media(sdp: &mut String, info: &AudioInfo) {
    match info.codec {
        AudioCodec::Aac => {
            let pt = PAYLOAD_TYPE_AAC;
            let config = audio_specific_config(info);
            let _ = write!(sdp, "m=audio 0 RTP/AVP {}\r\n", pt);
            let _ = write!(
                sdp,
                "a=rtpmap:{} MPEG4-GENERIC/{}/{}\r\n",
                pt, info.sample_rate, info.channels
            );
            let _ = write!(
                sdp,
                "a=fmtp:{} streamtype=5;profile-level-id=15;mode=AAC-hbr;config={:02X}{:02X};sizelength=13;indexlength=3;indexdeltalength=3\r\n",
                pt, config[0], config[1]
            );
        }
        AudioCodec::G711 => {
            let pt = PAYLOAD_TYPE_PCMA;
            let _ = write!(sdp, "m=audio 0 RTP/AVP {}\r\n", pt);
            let _ = write!(
                sdp,
                "a=rtpmap:{} PCMA/{}/{}\r\n",
                pt, info.sample_rate, info.channels
            );
        }
    }
    let _ = write!(sdp, "a=control:streamid={}\r\n", AUDIO_TRACK);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_h264_and_aac() {
        let video = VideoInfo::new(
            Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
            None,
        );
        let audio = AudioInfo::aac(44100, true);
        let sdp = session_description("192.168.1.10", Some(&video), Some(&audio));

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.10\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("sprop-parameter-sets=Z0LAHg==,aM48gA==;profile-level-id=42C01E\r\n"));
        assert!(sdp.contains("a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n"));
        assert!(sdp.contains("config=1210;"));
        assert!(sdp.contains("a=control:streamid=1\r\n"));
    }

    #[test]
    fn test_h265_video_only() {
        let video = VideoInfo::new(
            Bytes::from_static(&[0x42, 0x01]),
            Bytes::from_static(&[0x44, 0x01]),
            Some(Bytes::from_static(&[0x40, 0x01])),
        );
        let sdp = session_description("cam.local", Some(&video), None);

        assert!(sdp.contains("a=rtpmap:96 H265/90000\r\n"));
        assert!(sdp.contains("sprop-vps=QAE=;sprop-sps=QgE=;sprop-pps=RAE=\r\n"));
        assert!(!sdp.contains("m=audio"));
    }

    #[test]
    fn test_g711_audio_only() {
        let audio = AudioInfo {
            sample_rate: 8000,
            channels: 1,
            codec: AudioCodec::G711,
        };
        let sdp = session_description("::1", None, Some(&audio));

        assert!(sdp.contains("c=IN IP6 ::1\r\n"));
        assert!(sdp.contains("m=audio 0 RTP/AVP 8\r\n"));
        assert!(sdp.contains("a=rtpmap:8 PCMA/8000/1\r\n"));
        assert!(!sdp.contains("m=video"));
    }
}
