//! SRT caller carrying an MPEG-TS multiplex.
//!
//! The handshake is the HSv5 induction/conclusion exchange. After it the
//! session sends one transport stream payload per data packet, keeps a short
//! history for NAK driven retransmission and answers ACKs with ACKACK.

mod crypto;
mod packet;

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use livecast_ipc::{ClientType, StreamConfig};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use self::crypto::KeyMaterial;
use self::packet::{
    acked_seq, loss_list, ControlPacket, ControlType, DataPacket, Extension, ExtensionType,
    Handshake, EXT_CONFIG, EXT_HSREQ, EXT_KMREQ, HS_CONCLUSION, REJ_BADSECRET, REJ_UNSECURE,
    SRT_MAGIC,
};
use super::{Attempt, Protocol, Session};
use crate::error::TransportError;
use crate::packetizer::TsPacketizer;
use crate::wire::WireFrame;
use crate::{TransportResult, CONNECT_TIMEOUT_MS, SRT_KEEPALIVE_INTERVAL_MS, SRT_PAYLOAD_SIZE};

/// Handshake packets are repeated at this period until answered.
const HANDSHAKE_RESEND_MS: u64 = 250;

/// Sent packets kept for retransmission.
const SEND_HISTORY: usize = 1024;

const SEQ_MASK: u32 = 0x7FFF_FFFF;
const MSG_MASK: u32 = 0x03FF_FFFF;

/// SRT protocol marker.
pub struct Srt;

impl Protocol for Srt {
    const TYPE: ClientType = ClientType::Srt;
    type Packetizer = TsPacketizer;
    type Session = SrtSession;

    fn packetizer(_config: &StreamConfig) -> TsPacketizer {
        TsPacketizer::new()
    }

    async fn open(attempt: &Attempt) -> TransportResult<SrtSession> {
        let config = &attempt.config;
        let key = match config.passphrase.as_deref().filter(|p| !p.is_empty()) {
            Some(passphrase) => Some(KeyMaterial::generate(passphrase, config.key_length.bytes())?),
            None => None,
        };

        let address = attempt.endpoint.address();
        let remote = lookup_host(address.as_str()).await?.next().ok_or_else(|| {
            TransportError::ConnectionFailed(format!("cannot resolve {}", address))
        })?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!(%remote, "SRT socket ready");

        let socket_id = (rand::random::<u32>() & 0x3FFF_FFFF) | 1;
        let initial_seq = rand::random::<u32>() & SEQ_MASK;
        let start = Instant::now();
        let mtu = config.mtu as u32;

        let induction = Handshake::induction(socket_id, initial_seq, mtu);
        let response = handshake_round(&socket, &induction, 0, start).await?;
        if response.version != 5 || response.extension != SRT_MAGIC {
            return Err(TransportError::ConnectionFailed(format!(
                "peer answered handshake version {}",
                response.version
            )));
        }

        let mut conclusion = Handshake {
            version: 5,
            encryption: 0,
            extension: EXT_HSREQ,
            handshake_type: HS_CONCLUSION,
            cookie: response.cookie,
            peer_ip: peer_ip(remote.ip()),
            ..induction
        };
        conclusion
            .extensions
            .push(Extension::hs_request(config.srt_latency_ms));
        if let Some(ref key) = key {
            conclusion.encryption = (key.key_len() / 8) as u16;
            conclusion.extension |= EXT_KMREQ;
            conclusion.extensions.push(Extension::km_request(key.message()?));
            attempt.authenticating();
        }
        if let Some(stream_id) = attempt.endpoint.srt_stream_id() {
            conclusion.extension |= EXT_CONFIG;
            conclusion.extensions.push(Extension::stream_id(&stream_id));
        }

        let response = handshake_round(&socket, &conclusion, 0, start).await?;
        check_conclusion(&response, key.is_some())?;
        if key.is_some() {
            attempt.auth_succeeded();
        }

        info!(peer_socket = response.socket_id, encrypted = key.is_some(), "SRT connected");
        Ok(SrtSession {
            socket,
            peer_socket: response.socket_id,
            next_seq: initial_seq,
            next_msg: 1,
            start,
            key,
            history: VecDeque::with_capacity(SEND_HISTORY),
        })
    }
}

/// Send `handshake` until a handshake comes back.
async fn handshake_round(
    socket: &UdpSocket,
    handshake: &Handshake,
    dest_socket: u32,
    start: Instant,
) -> TransportResult<Handshake> {
    let mut control = ControlPacket::new(ControlType::Handshake, 0, handshake.encode());
    control.dest_socket = dest_socket;
    control.timestamp = elapsed_us(start);
    let request = control.encode();
    let mut buf = vec![0u8; 2048];

    let exchange = async {
        loop {
            socket.send(&request).await?;
            let resend = Duration::from_millis(HANDSHAKE_RESEND_MS);
            let Ok(read) = timeout(resend, socket.recv(&mut buf)).await else {
                trace!("Handshake not answered, resending");
                continue;
            };
            let n = read?;
            let Some(packet) = ControlPacket::parse(&buf[..n]) else {
                continue;
            };
            if packet.kind() != Some(ControlType::Handshake) {
                continue;
            }
            if let Some(answer) = Handshake::parse(&packet.body) {
                return Ok::<Handshake, TransportError>(answer);
            }
        }
    };

    timeout(Duration::from_millis(CONNECT_TIMEOUT_MS), exchange)
        .await
        .map_err(|_| TransportError::Timeout("SRT handshake"))?
}

/// Validate the conclusion response.
fn check_conclusion(response: &Handshake, encrypted: bool) -> TransportResult<()> {
    match response.handshake_type {
        REJ_BADSECRET | REJ_UNSECURE => {
            return Err(TransportError::AuthenticationFailed(format!(
                "SRT passphrase rejected ({})",
                response.handshake_type
            )))
        }
        t if response.is_rejection() => {
            return Err(TransportError::ConnectionFailed(format!(
                "SRT connection rejected ({})",
                t
            )))
        }
        HS_CONCLUSION => {}
        t => {
            return Err(TransportError::Protocol(format!(
                "unexpected handshake type {}",
                t
            )))
        }
    }

    if encrypted {
        match response.extension(ExtensionType::KmRsp) {
            Some(km) if km.data.len() > 4 => {}
            _ => {
                return Err(TransportError::AuthenticationFailed(
                    "SRT key material refused".to_string(),
                ))
            }
        }
    }
    if response.extension(ExtensionType::HsRsp).is_none() {
        warn!("SRT peer sent no HSRSP");
    }
    Ok(())
}

fn peer_ip(ip: IpAddr) -> [u8; 16] {
    let mut out = [0u8; 16];
    match ip {
        IpAddr::V4(v4) => out[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.copy_from_slice(&v6.octets()),
    }
    out
}

fn elapsed_us(start: Instant) -> u32 {
    start.elapsed().as_micros() as u32
}

/// Returns true when `a` comes before `b` in the wrapping sequence space.
fn seq_before(a: u32, b: u32) -> bool {
    let diff = b.wrapping_sub(a) & SEQ_MASK;
    diff != 0 && diff < SEQ_MASK / 2
}

/// An established SRT connection.
pub struct SrtSession {
    socket: UdpSocket,
    peer_socket: u32,
    next_seq: u32,
    next_msg: u32,
    start: Instant,
    key: Option<KeyMaterial>,
    history: VecDeque<DataPacket>,
}

impl SrtSession {
    async fn send_control(&self, mut packet: ControlPacket) -> TransportResult<()> {
        packet.dest_socket = self.peer_socket;
        packet.timestamp = elapsed_us(self.start);
        self.socket.send(&packet.encode()).await?;
        Ok(())
    }

    async fn retransmit(&self, ranges: &[(u32, u32)]) -> TransportResult<()> {
        for packet in self
            .history
            .iter()
            .filter(|p| ranges.iter().any(|&(first, last)| p.seq >= first && p.seq <= last))
        {
            trace!(seq = packet.seq, "Retransmitting");
            let resent = DataPacket {
                retransmitted: true,
                timestamp: elapsed_us(self.start),
                ..packet.clone()
            };
            self.socket.send(&resent.encode()).await?;
        }
        Ok(())
    }
}

impl Session for SrtSession {
    async fn send(&mut self, frame: &WireFrame) -> TransportResult<()> {
        if frame.len() > SRT_PAYLOAD_SIZE {
            return Err(TransportError::Send(format!(
                "SRT payload of {} bytes",
                frame.len()
            )));
        }

        let seq = self.next_seq;
        self.next_seq = (seq + 1) & SEQ_MASK;
        let msg_no = self.next_msg;
        self.next_msg = (msg_no % MSG_MASK) + 1;

        let payload = match self.key {
            Some(ref key) => {
                let mut data = BytesMut::from(&frame.data[..]);
                key.encrypt(seq, &mut data)?;
                data.freeze()
            }
            None => frame.data.clone(),
        };
        let packet = DataPacket {
            seq,
            msg_no,
            encrypted: self.key.is_some(),
            retransmitted: false,
            timestamp: elapsed_us(self.start),
            dest_socket: self.peer_socket,
            payload,
        };
        self.socket.send(&packet.encode()).await?;

        if self.history.len() == SEND_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(packet);
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    async fn handle_input(&mut self, data: &[u8]) -> TransportResult<()> {
        let Some(packet) = ControlPacket::parse(data) else {
            return Ok(());
        };
        match packet.kind() {
            Some(ControlType::Ack) => {
                if let Some(acked) = acked_seq(&packet.body) {
                    while self
                        .history
                        .front()
                        .is_some_and(|p| seq_before(p.seq, acked))
                    {
                        self.history.pop_front();
                    }
                }
                if packet.body.len() > 4 {
                    let ackack = ControlPacket::new(ControlType::AckAck, packet.type_info, Bytes::new());
                    self.send_control(ackack).await?;
                }
            }
            Some(ControlType::Nak) => {
                let ranges = loss_list(&packet.body);
                debug!(?ranges, "Loss reported");
                self.retransmit(&ranges).await?;
            }
            Some(ControlType::Shutdown) => {
                return Err(TransportError::ConnectionLost(
                    "SRT peer shut down the connection".to_string(),
                ));
            }
            Some(kind) => trace!(?kind, "Control packet ignored"),
            None => trace!(control_type = packet.control_type, "Unknown control packet"),
        }
        Ok(())
    }

    async fn keepalive(&mut self) -> TransportResult<()> {
        self.send_control(ControlPacket::new(ControlType::KeepAlive, 0, Bytes::new()))
            .await
    }

    fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(SRT_KEEPALIVE_INTERVAL_MS)
    }

    async fn close(&mut self) {
        let shutdown = ControlPacket::new(ControlType::Shutdown, 0, Bytes::new());
        if let Err(e) = self.send_control(shutdown).await {
            debug!("SRT shutdown not delivered: {}", e);
        }
    }
}
