//! SRT packet layout: the 16-byte header, handshake CIF with its
//! extensions, and the few control bodies a sender has to read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the packet header.
pub const HEADER_SIZE: usize = 16;

/// Size of the handshake CIF without extensions.
pub const HANDSHAKE_SIZE: usize = 48;

/// Library version announced in HSREQ (1.5.0).
pub const SRT_VERSION: u32 = 0x0001_0500;

/// Extension field of the induction response.
pub const SRT_MAGIC: u16 = 0x4A17;

const CONTROL_FLAG: u32 = 0x8000_0000;
const SEQ_MASK: u32 = 0x7FFF_FFFF;
const MSG_MASK: u32 = 0x03FF_FFFF;

/// TSBPD send and receive, crypt, too-late drop, periodic NAK, rexmit flag.
const HSREQ_FLAGS: u32 = 0x3F;

/// Handshake extension flags.
pub const EXT_HSREQ: u16 = 0x1;
pub const EXT_KMREQ: u16 = 0x2;
pub const EXT_CONFIG: u16 = 0x4;

/// Handshake types carried in the CIF.
pub const HS_INDUCTION: i32 = 1;
pub const HS_CONCLUSION: i32 = -1;

/// Handshake rejections start here.
pub const HS_REJECT_BASE: i32 = 1000;
pub const REJ_BADSECRET: i32 = 1010;
pub const REJ_UNSECURE: i32 = 1011;

/// Control packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlType {
    Handshake = 0,
    KeepAlive = 1,
    Ack = 2,
    Nak = 3,
    CongestionWarning = 4,
    Shutdown = 5,
    AckAck = 6,
    DropReq = 7,
    PeerError = 8,
}

impl ControlType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::Handshake,
            1 => Self::KeepAlive,
            2 => Self::Ack,
            3 => Self::Nak,
            4 => Self::CongestionWarning,
            5 => Self::Shutdown,
            6 => Self::AckAck,
            7 => Self::DropReq,
            8 => Self::PeerError,
            _ => return None,
        })
    }
}

/// Handshake extension types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ExtensionType {
    HsReq = 1,
    HsRsp = 2,
    KmReq = 3,
    KmRsp = 4,
    StreamId = 5,
}

/// A media packet.
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub seq: u32,
    pub msg_no: u32,
    pub encrypted: bool,
    pub retransmitted: bool,
    pub timestamp: u32,
    pub dest_socket: u32,
    pub payload: Bytes,
}

impl DataPacket {
    /// Serialize. The payload is always a solo, in-order message.
    pub fn encode(&self) -> Bytes {
        let mut msg = (0b11 << 30) | (1 << 29) | (self.msg_no & MSG_MASK);
        if self.encrypted {
            msg |= 0b01 << 27;
        }
        if self.retransmitted {
            msg |= 1 << 26;
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.seq & SEQ_MASK);
        buf.put_u32(msg);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_socket);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// A control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub control_type: u16,
    pub subtype: u16,
    pub type_info: u32,
    pub timestamp: u32,
    pub dest_socket: u32,
    pub body: Bytes,
}

impl ControlPacket {
    pub fn new(control_type: ControlType, type_info: u32, body: Bytes) -> Self {
        Self {
            control_type: control_type as u16,
            subtype: 0,
            type_info,
            timestamp: 0,
            dest_socket: 0,
            body,
        }
    }

    pub fn kind(&self) -> Option<ControlType> {
        ControlType::from_u16(self.control_type)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        buf.put_u32(CONTROL_FLAG | ((self.control_type as u32) << 16) | self.subtype as u32);
        buf.put_u32(self.type_info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_socket);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse a control packet. Data packets and runts yield `None`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let mut buf = data;
        let first = buf.get_u32();
        if first & CONTROL_FLAG == 0 {
            return None;
        }
        Some(Self {
            control_type: ((first >> 16) & 0x7FFF) as u16,
            subtype: first as u16,
            type_info: buf.get_u32(),
            timestamp: buf.get_u32(),
            dest_socket: buf.get_u32(),
            body: Bytes::copy_from_slice(buf),
        })
    }
}

/// A handshake extension block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub ext_type: u16,
    pub data: Bytes,
}

impl Extension {
    /// HSREQ announcing TSBPD with `latency_ms` in both directions.
    pub fn hs_request(latency_ms: u16) -> Self {
        let mut data = BytesMut::with_capacity(12);
        data.put_u32(SRT_VERSION);
        data.put_u32(HSREQ_FLAGS);
        data.put_u16(latency_ms);
        data.put_u16(latency_ms);
        Self {
            ext_type: ExtensionType::HsReq as u16,
            data: data.freeze(),
        }
    }

    /// KMREQ carrying a key material message.
    pub fn km_request(message: Bytes) -> Self {
        Self {
            ext_type: ExtensionType::KmReq as u16,
            data: message,
        }
    }

    /// Stream id, zero padded, with every 32-bit word byte swapped.
    pub fn stream_id(id: &str) -> Self {
        let mut bytes = id.as_bytes().to_vec();
        bytes.resize(bytes.len().div_ceil(4) * 4, 0);
        for word in bytes.chunks_mut(4) {
            word.reverse();
        }
        Self {
            ext_type: ExtensionType::StreamId as u16,
            data: Bytes::from(bytes),
        }
    }
}

/// Handshake control information field (HSv5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub encryption: u16,
    pub extension: u16,
    pub initial_seq: u32,
    pub mtu: u32,
    pub flow_window: u32,
    pub handshake_type: i32,
    pub socket_id: u32,
    pub cookie: u32,
    pub peer_ip: [u8; 16],
    pub extensions: Vec<Extension>,
}

impl Handshake {
    /// First caller packet.
    pub fn induction(socket_id: u32, initial_seq: u32, mtu: u32) -> Self {
        Self {
            version: 4,
            encryption: 0,
            extension: 2,
            initial_seq,
            mtu,
            flow_window: 8192,
            handshake_type: HS_INDUCTION,
            socket_id,
            cookie: 0,
            peer_ip: [0; 16],
            extensions: Vec::new(),
        }
    }

    /// Returns true when the peer refused the connection.
    pub fn is_rejection(&self) -> bool {
        self.handshake_type >= HS_REJECT_BASE
    }

    pub fn extension(&self, kind: ExtensionType) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.ext_type == kind as u16)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_SIZE + 64);
        buf.put_u32(self.version);
        buf.put_u16(self.encryption);
        buf.put_u16(self.extension);
        buf.put_u32(self.initial_seq & SEQ_MASK);
        buf.put_u32(self.mtu);
        buf.put_u32(self.flow_window);
        buf.put_i32(self.handshake_type);
        buf.put_u32(self.socket_id);
        buf.put_u32(self.cookie);
        buf.put_slice(&self.peer_ip);
        for ext in &self.extensions {
            buf.put_u16(ext.ext_type);
            buf.put_u16(ext.data.len().div_ceil(4) as u16);
            buf.put_slice(&ext.data);
            buf.put_bytes(0, ext.data.len().next_multiple_of(4) - ext.data.len());
        }
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HANDSHAKE_SIZE {
            return None;
        }
        let mut buf = data;
        let mut handshake = Self {
            version: buf.get_u32(),
            encryption: buf.get_u16(),
            extension: buf.get_u16(),
            initial_seq: buf.get_u32(),
            mtu: buf.get_u32(),
            flow_window: buf.get_u32(),
            handshake_type: buf.get_i32(),
            socket_id: buf.get_u32(),
            cookie: buf.get_u32(),
            peer_ip: [0; 16],
            extensions: Vec::new(),
        };
        buf.copy_to_slice(&mut handshake.peer_ip);

        while buf.remaining() >= 4 {
            let ext_type = buf.get_u16();
            let len = buf.get_u16() as usize * 4;
            if buf.remaining() < len {
                return None;
            }
            handshake.extensions.push(Extension {
                ext_type,
                data: Bytes::copy_from_slice(&buf[..len]),
            });
            buf.advance(len);
        }
        Some(handshake)
    }
}

/// Sequence number acknowledged by an ACK body.
pub fn acked_seq(body: &[u8]) -> Option<u32> {
    if body.len() < 4 {
        return None;
    }
    Some((&body[..4]).get_u32() & SEQ_MASK)
}

/// Loss ranges of a NAK body, inclusive.
pub fn loss_list(body: &[u8]) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut buf = body;
    while buf.remaining() >= 4 {
        let word = buf.get_u32();
        if word & CONTROL_FLAG != 0 {
            if buf.remaining() < 4 {
                break;
            }
            let last = buf.get_u32() & SEQ_MASK;
            ranges.push((word & SEQ_MASK, last));
        } else {
            ranges.push((word, word));
        }
    }
    ranges
}
