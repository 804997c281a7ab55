//! RTMP publisher built on the `rml_rtmp` session.

use std::io;
use std::time::Duration;

use livecast_ipc::{AudioCodec, ClientType, StreamConfig, VideoCodec};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::{Attempt, Protocol, Session};
use crate::auth::adobe::{self, AdobeStep};
use crate::error::TransportError;
use crate::packetizer::FlvPacketizer;
use crate::wire::{Track, WireFrame};
use crate::{TransportResult, CONNECT_TIMEOUT_MS, RTMP_KEEPALIVE_INTERVAL_SECS};

/// Connect rounds allowed for Adobe authentication (plain, user, response).
const MAX_AUTH_ROUNDS: usize = 3;

/// Largest chunk size RTMP can signal.
const MAX_CHUNK_SIZE: u32 = 0x00FF_FFFF;

/// RTMP protocol marker.
pub struct Rtmp;

impl Protocol for Rtmp {
    const TYPE: ClientType = ClientType::Rtmp;
    type Packetizer = FlvPacketizer;
    type Session = RtmpSession;

    fn packetizer(config: &StreamConfig) -> FlvPacketizer {
        let mut packetizer = FlvPacketizer::new();
        packetizer.set_force_increasing_timestamps(config.force_increasing_timestamps);
        packetizer
    }

    fn configure(packetizer: &mut FlvPacketizer, config: &StreamConfig) {
        packetizer.set_force_increasing_timestamps(config.force_increasing_timestamps);
    }

    async fn open(attempt: &Attempt) -> TransportResult<RtmpSession> {
        let (app, stream_key) = attempt.endpoint.rtmp_app_and_key()?;
        let credentials = attempt.credentials();
        let mut auth_query: Option<String> = None;

        for _ in 0..MAX_AUTH_ROUNDS {
            let app_name = format!("{}{}", app, auth_query.as_deref().unwrap_or(""));
            let mut connection = RtmpConnection::open(attempt, &app_name).await?;

            match connection.request_connection(&app_name).await? {
                None => {
                    if auth_query.is_some() {
                        attempt.auth_succeeded();
                    }
                    connection.publish(&stream_key).await?;
                    connection.send_metadata(attempt).await?;
                    info!(app = %app, "RTMP publishing started");
                    return Ok(RtmpSession {
                        stream: connection.stream,
                        session: connection.session,
                    });
                }
                Some(description) => {
                    debug!(%description, "Connect rejected");
                    let step = adobe::parse_rejection(&description);
                    auth_query = Some(next_auth_query(step, credentials.as_ref(), &description)?);
                    attempt.authenticating();
                }
            }
        }

        Err(TransportError::AuthenticationFailed(
            "too many authentication rounds".to_string(),
        ))
    }
}

fn next_auth_query(
    step: Option<AdobeStep>,
    credentials: Option<&(String, String)>,
    description: &str,
) -> TransportResult<String> {
    match (step, credentials) {
        (None, _) => Err(TransportError::ConnectionFailed(format!(
            "connection rejected: {}",
            description
        ))),
        (Some(_), None) => Err(TransportError::AuthenticationFailed(
            "server requires credentials".to_string(),
        )),
        (Some(AdobeStep::Failed), Some(_)) => {
            Err(TransportError::AuthenticationFailed(description.to_string()))
        }
        (Some(AdobeStep::NeedUser), Some((user, _))) => Ok(adobe::user_query(user)),
        (
            Some(AdobeStep::Challenge {
                salt,
                challenge,
                opaque,
            }),
            Some((user, password)),
        ) => Ok(adobe::response_query(
            user,
            password,
            &salt,
            challenge.as_deref(),
            opaque.as_deref(),
        )),
    }
}

/// A TCP connection during the RTMP handshake and command exchange.
struct RtmpConnection {
    stream: TcpStream,
    session: ClientSession,
}

impl RtmpConnection {
    /// Connect, run the RTMP handshake and create the client session.
    async fn open(attempt: &Attempt, app_name: &str) -> TransportResult<Self> {
        let address = attempt.endpoint.address();
        debug!(%address, "Opening TCP connection");

        let mut stream = timeout(connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| TransportError::Timeout("TCP connect"))?
            .map_err(|e| TransportError::ConnectionFailed(format!("TCP connect failed: {}", e)))?;
        stream.set_nodelay(true)?;

        let leftover = timeout(connect_timeout(), handshake(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout("RTMP handshake"))??;

        debug!("Handshake complete, creating RTMP session");
        let mut config = ClientSessionConfig::new();
        config.chunk_size = attempt.config.write_chunk_size.clamp(1, MAX_CHUNK_SIZE);
        config.tc_url = Some(attempt.endpoint.rtmp_tc_url(app_name));

        let (session, initial_results) = ClientSession::new(config).map_err(|e| {
            TransportError::ConnectionFailed(format!("Session creation failed: {:?}", e))
        })?;

        let mut connection = Self { stream, session };
        connection.write_results(initial_results).await?;
        if !leftover.is_empty() {
            let results = connection.session.handle_input(&leftover).map_err(|e| {
                TransportError::Protocol(format!("Session input error: {:?}", e))
            })?;
            connection.write_results(results).await?;
        }
        Ok(connection)
    }

    /// Send `connect`. Returns the rejection description, if any.
    async fn request_connection(&mut self, app_name: &str) -> TransportResult<Option<String>> {
        debug!(app = %app_name, "Requesting RTMP connection");
        let request = self
            .session
            .request_connection(app_name.to_string())
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Connection request failed: {:?}", e))
            })?;
        self.write_results(vec![request]).await?;

        self.wait_for("connection acceptance", |event| match event {
            ClientSessionEvent::ConnectionRequestAccepted => Some(None),
            ClientSessionEvent::ConnectionRequestRejected { description } => {
                Some(Some(description))
            }
            _ => None,
        })
        .await
    }

    async fn publish(&mut self, stream_key: &str) -> TransportResult<()> {
        debug!("Requesting publish");
        let request = self
            .session
            .request_publishing(stream_key.to_string(), PublishRequestType::Live)
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Publish request failed: {:?}", e))
            })?;
        self.write_results(vec![request]).await?;

        self.wait_for("publish acceptance", |event| match event {
            ClientSessionEvent::PublishRequestAccepted => Some(()),
            _ => None,
        })
        .await
    }

    /// `@setDataFrame onMetaData` describing the tracks being published.
    async fn send_metadata(&mut self, attempt: &Attempt) -> TransportResult<()> {
        let mut metadata = StreamMetadata::new();
        if !attempt.config.only_audio {
            if let Some(info) = attempt.video_info() {
                metadata.video_width = info.width;
                metadata.video_height = info.height;
                metadata.video_frame_rate = info.fps.map(|fps| fps as f32);
                metadata.video_codec_id = Some(video_codec_id(info.codec()));
            }
        }
        if !attempt.config.only_video {
            if let Some(audio) = attempt.audio_info() {
                metadata.audio_sample_rate = Some(audio.sample_rate);
                metadata.audio_channels = Some(audio.channels as u32);
                metadata.audio_is_stereo = Some(audio.is_stereo());
                metadata.audio_codec_id = Some(audio_codec_id(audio.codec));
            }
        }
        metadata.encoder = Some(format!("livecast {}", env!("CARGO_PKG_VERSION")));

        let result = self.session.publish_metadata(&metadata).map_err(|e| {
            TransportError::Send(format!("Failed to publish metadata: {:?}", e))
        })?;
        self.write_results(vec![result]).await
    }

    /// Read until `matcher` accepts a session event.
    async fn wait_for<T>(
        &mut self,
        what: &'static str,
        matcher: impl FnMut(ClientSessionEvent) -> Option<T>,
    ) -> TransportResult<T> {
        timeout(connect_timeout(), self.read_until(matcher))
            .await
            .map_err(|_| TransportError::Timeout(what))?
    }

    async fn read_until<T>(
        &mut self,
        mut matcher: impl FnMut(ClientSessionEvent) -> Option<T>,
    ) -> TransportResult<T> {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(TransportError::ConnectionFailed(
                    "Connection closed by server".to_string(),
                ));
            }

            let results = self.session.handle_input(&buf[..n]).map_err(|e| {
                TransportError::Protocol(format!("Session input error: {:?}", e))
            })?;
            let mut matched = None;
            let mut outbound = Vec::new();
            for result in results {
                match result {
                    ClientSessionResult::RaisedEvent(event) => {
                        trace!("Received event: {:?}", event);
                        if matched.is_none() {
                            matched = matcher(event);
                        }
                    }
                    other => outbound.push(other),
                }
            }
            self.write_results(outbound).await?;
            if let Some(value) = matched {
                return Ok(value);
            }
        }
    }

    async fn write_results(&mut self, results: Vec<ClientSessionResult>) -> TransportResult<()> {
        write_results(&mut self.stream, results).await
    }
}

/// An RTMP connection in the publishing state.
pub struct RtmpSession {
    stream: TcpStream,
    session: ClientSession,
}

impl Session for RtmpSession {
    async fn send(&mut self, frame: &WireFrame) -> TransportResult<()> {
        let timestamp = RtmpTimestamp::new(frame.timestamp);
        let result = match frame.track {
            Track::Video => {
                self.session
                    .publish_video_data(frame.data.clone(), timestamp, false)
            }
            Track::Audio => {
                self.session
                    .publish_audio_data(frame.data.clone(), timestamp, false)
            }
        }
        .map_err(|e| TransportError::Send(format!("Failed to publish data: {:?}", e)))?;

        write_results(&mut self.stream, vec![result]).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn handle_input(&mut self, data: &[u8]) -> TransportResult<()> {
        let results = self
            .session
            .handle_input(data)
            .map_err(|e| TransportError::Protocol(format!("Session input error: {:?}", e)))?;
        write_results(&mut self.stream, results).await
    }

    async fn keepalive(&mut self) -> TransportResult<()> {
        // A reset connection has no peer any more.
        self.stream.peer_addr()?;
        Ok(())
    }

    fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(RTMP_KEEPALIVE_INTERVAL_SECS)
    }

    async fn close(&mut self) {
        if let Ok(results) = self.session.stop_publishing() {
            let _ = write_results(&mut self.stream, results).await;
        }
        let _ = self.stream.shutdown().await;
    }
}

async fn handshake(stream: &mut TcpStream) -> TransportResult<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Client);

    let p0_and_p1 = handshake.generate_outbound_p0_and_p1().map_err(|e| {
        TransportError::ConnectionFailed(format!("Handshake generation failed: {:?}", e))
    })?;
    stream.write_all(&p0_and_p1).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::ConnectionFailed(
                "Connection closed during handshake".to_string(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "Handshake failed: {:?}",
                    e
                )))
            }
        }
    }
}

async fn write_results(
    stream: &mut TcpStream,
    results: Vec<ClientSessionResult>,
) -> TransportResult<()> {
    for result in results {
        match result {
            ClientSessionResult::OutboundResponse(packet) => {
                stream.write_all(&packet.bytes).await?;
            }
            ClientSessionResult::RaisedEvent(event) => trace!("Session event: {:?}", event),
            _ => trace!("Unhandled RTMP message"),
        }
    }
    Ok(())
}

/// `videocodecid` of onMetaData: FLV codec id 7 for AVC, the `hvc1` FourCC
/// of enhanced RTMP for HEVC.
fn video_codec_id(codec: VideoCodec) -> u32 {
    match codec {
        VideoCodec::H264 => 7,
        VideoCodec::H265 => u32::from_be_bytes(*b"hvc1"),
    }
}

/// `audiocodecid` of onMetaData: FLV sound format 10 (AAC) or 7 (A-law).
fn audio_codec_id(codec: AudioCodec) -> u32 {
    match codec {
        AudioCodec::Aac => 10,
        AudioCodec::G711 => 7,
    }
}

fn connect_timeout() -> Duration {
    Duration::from_millis(CONNECT_TIMEOUT_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use livecast_ipc::{event_channel, VideoInfo};
    use rml_rtmp::sessions::{
        ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
    };
    use tokio::net::TcpListener;

    use crate::wire::FrameKind;

    /// What a publisher delivered to the loopback server.
    struct Published {
        app_name: String,
        stream_key: String,
        metadata: Option<StreamMetadata>,
        video: Bytes,
    }

    async fn write_server_results(stream: &mut TcpStream, results: Vec<ServerSessionResult>) {
        for result in results {
            if let ServerSessionResult::OutboundResponse(packet) = result {
                stream.write_all(&packet.bytes).await.unwrap();
            }
        }
    }

    /// Accept one publisher and return once it sends a video tag.
    async fn serve_publisher(listener: TcpListener) -> Published {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];

        let mut handshake = Handshake::new(PeerType::Server);
        let leftover = loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "publisher closed during handshake");
            match handshake.process_bytes(&buf[..n]).unwrap() {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    stream.write_all(&response_bytes).await.unwrap();
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    stream.write_all(&response_bytes).await.unwrap();
                    break remaining_bytes;
                }
            }
        };

        let (mut session, initial) = ServerSession::new(ServerSessionConfig::new()).unwrap();
        write_server_results(&mut stream, initial).await;

        let mut app_name = String::new();
        let mut stream_key = String::new();
        let mut metadata = None;
        let mut input = leftover;
        loop {
            let mut outbound = Vec::new();
            for result in session.handle_input(&input).unwrap() {
                match result {
                    ServerSessionResult::RaisedEvent(event) => match event {
                        ServerSessionEvent::ConnectionRequested {
                            request_id,
                            app_name: app,
                        } => {
                            app_name = app;
                            outbound.extend(session.accept_request(request_id).unwrap());
                        }
                        ServerSessionEvent::PublishStreamRequested {
                            request_id,
                            stream_key: key,
                            ..
                        } => {
                            stream_key = key;
                            outbound.extend(session.accept_request(request_id).unwrap());
                        }
                        ServerSessionEvent::StreamMetadataChanged { metadata: m, .. } => {
                            metadata = Some(m);
                        }
                        ServerSessionEvent::VideoDataReceived { data, .. } => {
                            return Published {
                                app_name,
                                stream_key,
                                metadata,
                                video: data,
                            };
                        }
                        _ => {}
                    },
                    other => outbound.push(other),
                }
            }
            write_server_results(&mut stream, outbound).await;

            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "publisher closed before sending video");
            input = buf[..n].to_vec();
        }
    }

    fn creds() -> (String, String) {
        ("bob".to_string(), "secret".to_string())
    }

    #[test]
    fn test_plain_rejection_is_connection_failure() {
        let err = next_auth_query(None, Some(&creds()), "NetConnection.Connect.Rejected")
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[test]
    fn test_auth_without_credentials() {
        let err = next_auth_query(Some(AdobeStep::NeedUser), None, "need auth").unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    fn test_auth_rounds() {
        let query = next_auth_query(Some(AdobeStep::NeedUser), Some(&creds()), "").unwrap();
        assert_eq!(query, "?authmod=adobe&user=bob");

        let query = next_auth_query(
            Some(AdobeStep::Challenge {
                salt: "salt".into(),
                challenge: Some("ch".into()),
                opaque: None,
            }),
            Some(&creds()),
            "",
        )
        .unwrap();
        assert!(query.contains("&response="));

        let err = next_auth_query(Some(AdobeStep::Failed), Some(&creds()), "authfailed")
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_publish_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_publisher(listener));

        let (sink, _events) = event_channel();
        let url = format!("rtmp://127.0.0.1:{}/live/key", port);
        let attempt = Attempt::for_test(&url, StreamConfig::default(), sink);
        let info = VideoInfo::new(
            Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
            None,
        )
        .with_geometry(1280, 720, 30);
        attempt.set_formats(Some(info), None);

        let mut session = Rtmp::open(&attempt).await.unwrap();
        // AVC NALU packet carrying one IDR slice.
        let tag = WireFrame::new(
            Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 0, 0, 0, 3, 0x65, 0x88, 0x84]),
            40,
            FrameKind::KeyFrame,
            Track::Video,
        );
        session.send(&tag).await.unwrap();

        let published = timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.app_name, "live");
        assert_eq!(published.stream_key, "key");
        let metadata = published.metadata.unwrap();
        assert_eq!(metadata.video_codec_id, Some(7));
        assert_eq!(metadata.video_width, Some(1280));
        assert_eq!(metadata.video_height, Some(720));
        assert_eq!(metadata.audio_codec_id, None);
        assert_eq!(published.video, tag.data);

        session.close().await;
    }
}
