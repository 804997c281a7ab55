//! Common types shared by the transport and the engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Default number of wire frames the per-client cache holds.
pub const DEFAULT_CACHE_CAPACITY: usize = 400;

/// Kind of one encoded access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    /// Video access unit decodable on its own.
    VideoKey,

    /// Video access unit referencing previous frames.
    VideoDelta,

    /// Audio access unit.
    Audio,
}

impl UnitKind {
    /// Returns true for video units.
    pub fn is_video(self) -> bool {
        matches!(self, Self::VideoKey | Self::VideoDelta)
    }
}

/// One encoded access unit as produced by the encoder.
///
/// The payload is reference counted; packetizers only read it.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    /// Encoded bytes. Video is Annex B, audio is raw (no ADTS header).
    pub data: Bytes,

    /// Presentation timestamp in microseconds.
    pub pts_us: u64,

    /// Unit kind.
    pub kind: UnitKind,
}

impl EncodedUnit {
    /// Create a video unit.
    pub fn video(data: impl Into<Bytes>, pts_us: u64, is_keyframe: bool) -> Self {
        Self {
            data: data.into(),
            pts_us,
            kind: if is_keyframe {
                UnitKind::VideoKey
            } else {
                UnitKind::VideoDelta
            },
        }
    }

    /// Create an audio unit.
    pub fn audio(data: impl Into<Bytes>, pts_us: u64) -> Self {
        Self {
            data: data.into(),
            pts_us,
            kind: UnitKind::Audio,
        }
    }

    /// Returns true for video key-frames.
    pub fn is_keyframe(&self) -> bool {
        self.kind == UnitKind::VideoKey
    }

    /// Returns true when there is nothing to packetize.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Video codec carried by the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

/// Audio codec carried by the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Aac,
    /// G.711 A-law.
    G711,
}

/// Out-of-band video format data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoInfo {
    /// Sequence parameter set, without start code.
    pub sps: Bytes,

    /// Picture parameter set, without start code.
    pub pps: Bytes,

    /// Video parameter set (H265 only), without start code.
    pub vps: Option<Bytes>,

    /// Frame width in pixels, when known.
    pub width: Option<u32>,

    /// Frame height in pixels, when known.
    pub height: Option<u32>,

    /// Frames per second, when known.
    pub fps: Option<u32>,
}

impl VideoInfo {
    /// Build from parameter sets. Leading Annex B start codes are removed.
    pub fn new(sps: impl Into<Bytes>, pps: impl Into<Bytes>, vps: Option<Bytes>) -> Self {
        Self {
            sps: strip_start_code(sps.into()),
            pps: strip_start_code(pps.into()),
            vps: vps.map(strip_start_code),
            width: None,
            height: None,
            fps: None,
        }
    }

    /// Attach picture geometry used for stream metadata.
    pub fn with_geometry(mut self, width: u32, height: u32, fps: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self.fps = Some(fps);
        self
    }

    /// Codec implied by the parameter sets.
    pub fn codec(&self) -> VideoCodec {
        if self.vps.is_some() {
            VideoCodec::H265
        } else {
            VideoCodec::H264
        }
    }

    /// Returns true when both mandatory parameter sets are present.
    pub fn is_complete(&self) -> bool {
        !self.sps.is_empty() && !self.pps.is_empty()
    }
}

/// Out-of-band audio format data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Channel count (1 or 2).
    pub channels: u8,

    /// Audio codec.
    pub codec: AudioCodec,
}

impl AudioInfo {
    /// AAC format description.
    pub fn aac(sample_rate: u32, stereo: bool) -> Self {
        Self {
            sample_rate,
            channels: if stereo { 2 } else { 1 },
            codec: AudioCodec::Aac,
        }
    }

    /// Returns true for two channels.
    pub fn is_stereo(&self) -> bool {
        self.channels > 1
    }
}

impl Default for AudioInfo {
    fn default() -> Self {
        Self::aac(44100, true)
    }
}

/// The three protocol client variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Rtmp,
    Rtsp,
    Srt,
}

impl ClientType {
    /// Select the client for a URL by case-insensitive scheme prefix.
    ///
    /// `rtmps://` selects RTMP, `rtsps://` selects RTSP.
    pub fn from_url(url: &str) -> Option<Self> {
        let prefix = url.get(..4).unwrap_or(url).to_ascii_lowercase();
        if prefix == "rtmp" {
            Some(Self::Rtmp)
        } else if prefix == "rtsp" {
            Some(Self::Rtsp)
        } else if prefix.starts_with("srt") {
            Some(Self::Srt)
        } else {
            None
        }
    }

    /// Protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Rtmp => "rtmp",
            Self::Rtsp => "rtsp",
            Self::Srt => "srt",
        }
    }
}

/// Transport used for RTSP media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    /// RTP interleaved on the RTSP control connection.
    #[default]
    Tcp,

    /// RTP and RTCP over separate UDP ports.
    Udp,
}

/// SRT encryption key length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyLength {
    #[default]
    Aes128,
    Aes192,
    Aes256,
}

impl KeyLength {
    /// Key length in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }
}

/// Options recognized by every protocol client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// User name for protocol authentication.
    pub user: Option<String>,

    /// Password for protocol authentication.
    pub password: Option<String>,

    /// Number of caller-driven retries allowed per connect.
    pub retries: u32,

    /// Delay the caller should use between retries.
    pub retry_delay_ms: u64,

    /// Endpoint to retry against instead of the original one.
    pub backup_url: Option<String>,

    /// RTMP outgoing chunk size (1 to 16777215).
    pub write_chunk_size: u32,

    /// Force strictly increasing RTMP timestamps across tracks.
    pub force_increasing_timestamps: bool,

    /// RTSP media transport.
    pub rtsp_transport: RtspTransport,

    /// SRT passphrase. Empty or absent disables encryption.
    pub passphrase: Option<String>,

    /// SRT key length.
    pub key_length: KeyLength,

    /// SRT receiver latency in milliseconds.
    pub srt_latency_ms: u16,

    /// Network MTU used to size RTP and SRT packets.
    pub mtu: usize,

    /// Frame cache capacity in wire frames.
    pub cache_size: usize,

    /// Congestion threshold in percent of cache occupancy.
    pub congestion_threshold_percent: f32,

    /// Enable per-packet logs.
    pub logs: bool,

    /// Periodically check that the server is still alive.
    pub check_server_alive: bool,

    /// Stream audio only.
    pub only_audio: bool,

    /// Stream video only.
    pub only_video: bool,

    /// Video codec.
    pub video_codec: VideoCodec,

    /// Audio codec.
    pub audio_codec: AudioCodec,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            retries: 0,
            retry_delay_ms: 5000,
            backup_url: None,
            write_chunk_size: 128,
            force_increasing_timestamps: false,
            rtsp_transport: RtspTransport::Tcp,
            passphrase: None,
            key_length: KeyLength::Aes128,
            srt_latency_ms: 120,
            mtu: 1500,
            cache_size: DEFAULT_CACHE_CAPACITY,
            congestion_threshold_percent: 20.0,
            logs: true,
            check_server_alive: false,
            only_audio: false,
            only_video: false,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
        }
    }
}

impl StreamConfig {
    /// Credentials, when both parts are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

fn strip_start_code(data: Bytes) -> Bytes {
    if data.starts_with(&[0, 0, 0, 1]) {
        data.slice(4..)
    } else if data.starts_with(&[0, 0, 1]) {
        data.slice(3..)
    } else {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_type_from_url() {
        assert_eq!(ClientType::from_url("rtmp://host/app/key"), Some(ClientType::Rtmp));
        assert_eq!(ClientType::from_url("RTMPS://host/app/key"), Some(ClientType::Rtmp));
        assert_eq!(ClientType::from_url("rtsp://host/stream"), Some(ClientType::Rtsp));
        assert_eq!(ClientType::from_url("Srt://host:9000"), Some(ClientType::Srt));
        assert_eq!(ClientType::from_url("foo://bar"), None);
        assert_eq!(ClientType::from_url("rt"), None);
        assert_eq!(ClientType::from_url(""), None);
    }

    #[test]
    fn test_video_info_strips_start_codes() {
        let info = VideoInfo::new(
            Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42]),
            Bytes::from_static(&[0, 0, 1, 0x68, 0xCE]),
            None,
        );
        assert_eq!(info.sps.as_ref(), &[0x67, 0x42]);
        assert_eq!(info.pps.as_ref(), &[0x68, 0xCE]);
        assert_eq!(info.codec(), VideoCodec::H264);
        assert!(info.is_complete());
    }

    #[test]
    fn test_vps_selects_h265() {
        let info = VideoInfo::new(
            Bytes::from_static(&[0x42, 0x01]),
            Bytes::from_static(&[0x44, 0x01]),
            Some(Bytes::from_static(&[0x40, 0x01])),
        );
        assert_eq!(info.codec(), VideoCodec::H265);
    }

    #[test]
    fn test_encoded_unit_kinds() {
        let key = EncodedUnit::video(vec![1, 2, 3], 0, true);
        assert!(key.is_keyframe());
        assert!(key.kind.is_video());
        let audio = EncodedUnit::audio(Vec::new(), 10);
        assert!(audio.is_empty());
        assert!(!audio.kind.is_video());
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: StreamConfig = toml::from_str(
            r#"
            user = "alice"
            password = "secret"
            retries = 3
            rtsp_transport = "udp"
            key_length = "aes256"
            "#,
        )
        .unwrap();

        assert_eq!(config.credentials(), Some(("alice", "secret")));
        assert_eq!(config.retries, 3);
        assert_eq!(config.rtsp_transport, RtspTransport::Udp);
        assert_eq!(config.key_length.bytes(), 32);
        assert_eq!(config.cache_size, DEFAULT_CACHE_CAPACITY);
        assert_eq!(config.write_chunk_size, 128);
    }

    #[test]
    fn test_config_json_roundtrip_keeps_codecs() {
        let config = StreamConfig {
            video_codec: VideoCodec::H265,
            audio_codec: AudioCodec::G711,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"h265\""));
        let back: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
