//! RTSP publisher: ANNOUNCE, SETUP and RECORD, then RTP over the control
//! connection or over UDP.

mod message;
mod sdp;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use livecast_ipc::{AudioInfo, ClientType, RtspTransport, StreamConfig, VideoInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use self::message::{server_ports, take_message, Incoming, Request, Response};
use self::sdp::{session_description, AUDIO_TRACK, VIDEO_TRACK};
use super::{Attempt, Protocol, Session};
use crate::auth::Challenge;
use crate::error::TransportError;
use crate::packetizer::RtpPacketizer;
use crate::wire::{Track, WireFrame};
use crate::{
    TransportResult, CONNECT_TIMEOUT_MS, RTSP_KEEPALIVE_INTERVAL_SECS, VIDEO_INFO_TIMEOUT_MS,
};

/// Interleaved channel of video RTP. RTCP uses the next one.
const VIDEO_CHANNEL: u8 = 0;

/// Interleaved channel of audio RTP.
const AUDIO_CHANNEL: u8 = 2;

/// RTSP protocol marker.
pub struct Rtsp;

impl Protocol for Rtsp {
    const TYPE: ClientType = ClientType::Rtsp;
    type Packetizer = RtpPacketizer;
    type Session = RtspSession;

    fn packetizer(config: &StreamConfig) -> RtpPacketizer {
        RtpPacketizer::new(config.mtu)
    }

    fn configure(packetizer: &mut RtpPacketizer, config: &StreamConfig) {
        packetizer.set_mtu(config.mtu);
    }

    async fn open(attempt: &Attempt) -> TransportResult<RtspSession> {
        let video = if attempt.config.only_audio {
            None
        } else {
            let waited = attempt
                .wait_video_info(Duration::from_millis(VIDEO_INFO_TIMEOUT_MS))
                .await;
            match waited {
                Some(info) => Some(info),
                None => {
                    return Err(TransportError::ConnectionFailed(
                        "video parameter sets not received".to_string(),
                    ))
                }
            }
        };
        let audio = if attempt.config.only_video {
            None
        } else {
            attempt.audio_info()
        };
        if video.is_none() && audio.is_none() {
            return Err(TransportError::ConnectionFailed(
                "no track to announce".to_string(),
            ));
        }

        let address = attempt.endpoint.address();
        debug!(%address, "Opening RTSP control connection");
        let control = timeout(connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| TransportError::Timeout("RTSP connection"))??;
        control.set_nodelay(true)?;

        let mut session = RtspSession::new(
            control,
            attempt.endpoint.rtsp_url(),
            attempt.config.rtsp_transport,
        );
        session
            .record(attempt, video.as_ref(), audio.as_ref())
            .await?;
        info!(url = %session.url, transport = ?attempt.config.rtsp_transport, "RTSP recording started");
        Ok(session)
    }
}

/// Credentials answering the server's challenge.
struct Authorization {
    challenge: Challenge,
    user: String,
    password: String,
}

enum MediaTransport {
    /// `$`-framed RTP on the control connection.
    Interleaved,

    /// One connected socket per track.
    Udp {
        video: Option<UdpSocket>,
        audio: Option<UdpSocket>,
    },
}

/// An RTSP session in the RECORD state.
pub struct RtspSession {
    control: TcpStream,
    url: String,
    cseq: u32,
    session_id: Option<String>,
    auth: Option<Authorization>,
    transport: RtspTransport,
    media: MediaTransport,
    input: BytesMut,
}

impl RtspSession {
    fn new(control: TcpStream, url: String, transport: RtspTransport) -> Self {
        let media = match transport {
            RtspTransport::Tcp => MediaTransport::Interleaved,
            RtspTransport::Udp => MediaTransport::Udp {
                video: None,
                audio: None,
            },
        };
        Self {
            control,
            url,
            cseq: 0,
            session_id: None,
            auth: None,
            transport,
            media,
            input: BytesMut::with_capacity(4096),
        }
    }

    /// Run OPTIONS, ANNOUNCE, SETUP for each track and RECORD.
    async fn record(
        &mut self,
        attempt: &Attempt,
        video: Option<&VideoInfo>,
        audio: Option<&AudioInfo>,
    ) -> TransportResult<()> {
        let url = self.url.clone();
        self.exchange(attempt, Request::new("OPTIONS", url.clone()))
            .await?;

        let sdp = session_description(&attempt.endpoint.host, video, audio);
        trace!(%sdp, "ANNOUNCE body");
        self.exchange(
            attempt,
            Request::new("ANNOUNCE", url.clone()).body("application/sdp", sdp),
        )
        .await?;

        if video.is_some() {
            self.setup(attempt, Track::Video).await?;
        }
        if audio.is_some() {
            self.setup(attempt, Track::Audio).await?;
        }

        self.exchange(
            attempt,
            Request::new("RECORD", url).header("Range", "npt=0.000-"),
        )
        .await?;
        Ok(())
    }

    async fn setup(&mut self, attempt: &Attempt, track: Track) -> TransportResult<()> {
        let (stream_id, channel) = match track {
            Track::Video => (VIDEO_TRACK, VIDEO_CHANNEL),
            Track::Audio => (AUDIO_TRACK, AUDIO_CHANNEL),
        };
        let url = format!("{}/streamid={}", self.url, stream_id);

        match self.transport {
            RtspTransport::Tcp => {
                let transport = format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{};mode=record",
                    channel,
                    channel + 1
                );
                let request = Request::new("SETUP", url).header("Transport", transport);
                self.exchange(attempt, request).await?;
            }
            RtspTransport::Udp => {
                let local_ip = self.control.local_addr()?.ip();
                let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
                let rtp_port = socket.local_addr()?.port();
                let transport = format!(
                    "RTP/AVP;unicast;client_port={}-{};mode=record",
                    rtp_port,
                    rtp_port.wrapping_add(1)
                );
                let request = Request::new("SETUP", url).header("Transport", transport);
                let response = self.exchange(attempt, request).await?;

                let (server_rtp, _) = response
                    .header("Transport")
                    .and_then(server_ports)
                    .ok_or_else(|| {
                        TransportError::Protocol("SETUP response without server_port".to_string())
                    })?;
                let server_ip = self.control.peer_addr()?.ip();
                socket.connect(SocketAddr::new(server_ip, server_rtp)).await?;
                debug!(?track, local = rtp_port, remote = server_rtp, "UDP track ready");

                if let MediaTransport::Udp {
                    ref mut video,
                    ref mut audio,
                } = self.media
                {
                    match track {
                        Track::Video => *video = Some(socket),
                        Track::Audio => *audio = Some(socket),
                    }
                }
            }
        }
        Ok(())
    }

    /// Send a request and wait for its response, answering one
    /// authentication challenge on the way.
    async fn exchange(&mut self, attempt: &Attempt, request: Request) -> TransportResult<Response> {
        let method = request.method;
        let mut response = self.request(request.clone()).await?;

        if response.status == 401 {
            if self.auth.is_some() {
                return Err(TransportError::AuthenticationFailed(format!(
                    "{} rejected the credentials",
                    method
                )));
            }
            let Some((user, password)) = attempt.credentials() else {
                return Err(TransportError::AuthenticationFailed(
                    "server requires credentials".to_string(),
                ));
            };
            let challenge = preferred_challenge(&response).ok_or_else(|| {
                TransportError::AuthenticationFailed("unsupported authentication scheme".to_string())
            })?;
            debug!(?challenge, "Answering RTSP challenge");
            attempt.authenticating();
            self.auth = Some(Authorization {
                challenge,
                user,
                password,
            });

            response = self.request(request).await?;
            if response.status == 401 {
                return Err(TransportError::AuthenticationFailed(format!(
                    "{} rejected the credentials",
                    method
                )));
            }
            if response.is_success() {
                attempt.auth_succeeded();
            }
        }

        if !response.is_success() {
            return Err(TransportError::ConnectionFailed(format!(
                "{} failed: {} {}",
                method, response.status, response.reason
            )));
        }
        if let Some(id) = response.session_id() {
            self.session_id = Some(id);
        }
        Ok(response)
    }

    async fn request(&mut self, request: Request) -> TransportResult<Response> {
        let (cseq, bytes) = self.encode(request);
        self.control.write_all(&bytes).await?;
        timeout(connect_timeout(), self.read_response(cseq))
            .await
            .map_err(|_| TransportError::Timeout("RTSP response"))?
    }

    /// Stamp sequence number, session and authorization onto `request`.
    fn encode(&mut self, mut request: Request) -> (u32, Vec<u8>) {
        self.cseq += 1;
        if let Some(ref auth) = self.auth {
            let value =
                auth.challenge
                    .authorization(&auth.user, &auth.password, request.method, &request.url);
            request = request.header("Authorization", value);
        }
        if let Some(ref id) = self.session_id {
            request = request.header("Session", id.clone());
        }
        trace!(method = request.method, cseq = self.cseq, "RTSP request");
        (self.cseq, request.encode(self.cseq))
    }

    async fn read_response(&mut self, cseq: u32) -> TransportResult<Response> {
        loop {
            while let Some(message) = take_message(&mut self.input)? {
                match message {
                    Incoming::Response(response) if response.cseq().map_or(true, |c| c == cseq) => {
                        return Ok(response)
                    }
                    Incoming::Response(response) => {
                        debug!(cseq = ?response.cseq(), "Skipping stale RTSP response")
                    }
                    Incoming::Interleaved { .. } => {}
                }
            }
            if self.control.read_buf(&mut self.input).await? == 0 {
                return Err(TransportError::ConnectionLost(
                    "RTSP server closed the connection".to_string(),
                ));
            }
        }
    }
}

impl Session for RtspSession {
    async fn send(&mut self, frame: &WireFrame) -> TransportResult<()> {
        match self.media {
            MediaTransport::Interleaved => {
                let len = u16::try_from(frame.len()).map_err(|_| {
                    TransportError::Send(format!("RTP packet of {} bytes", frame.len()))
                })?;
                let channel = match frame.track {
                    Track::Video => VIDEO_CHANNEL,
                    Track::Audio => AUDIO_CHANNEL,
                };
                let mut out = Vec::with_capacity(4 + frame.len());
                out.push(b'$');
                out.push(channel);
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&frame.data);
                self.control.write_all(&out).await?;
            }
            MediaTransport::Udp {
                ref video,
                ref audio,
            } => {
                let socket = match frame.track {
                    Track::Video => video.as_ref(),
                    Track::Audio => audio.as_ref(),
                };
                if let Some(socket) = socket {
                    socket.send(&frame.data).await?;
                }
            }
        }
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.control.read(buf).await
    }

    async fn handle_input(&mut self, data: &[u8]) -> TransportResult<()> {
        self.input.extend_from_slice(data);
        while let Some(message) = take_message(&mut self.input)? {
            match message {
                Incoming::Response(response) if response.is_success() => {
                    trace!(cseq = ?response.cseq(), "RTSP keepalive answered");
                }
                Incoming::Response(response) => {
                    warn!(status = response.status, reason = %response.reason, "RTSP server complained");
                }
                Incoming::Interleaved { channel, len } => {
                    trace!(channel, len, "Interleaved data from server ignored");
                }
            }
        }
        Ok(())
    }

    async fn keepalive(&mut self) -> TransportResult<()> {
        let (_, bytes) = self.encode(Request::new("OPTIONS", self.url.clone()));
        self.control.write_all(&bytes).await?;
        Ok(())
    }

    fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(RTSP_KEEPALIVE_INTERVAL_SECS)
    }

    async fn close(&mut self) {
        let (_, bytes) = self.encode(Request::new("TEARDOWN", self.url.clone()));
        if let Err(e) = self.control.write_all(&bytes).await {
            debug!("TEARDOWN not delivered: {}", e);
        }
        let _ = self.control.shutdown().await;
    }
}

/// Digest when offered, Basic otherwise.
fn preferred_challenge(response: &Response) -> Option<Challenge> {
    let mut challenges = response
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("WWW-Authenticate"))
        .filter_map(|(_, value)| Challenge::parse(value));
    let first = challenges.next()?;
    if matches!(first, Challenge::Digest(_)) {
        return Some(first);
    }
    Some(
        challenges
            .find(|c| matches!(c, Challenge::Digest(_)))
            .unwrap_or(first),
    )
}

fn connect_timeout() -> Duration {
    Duration::from_millis(CONNECT_TIMEOUT_MS)
}
