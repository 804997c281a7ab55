//! Live streaming transport.
//!
//! This crate turns encoded access units into protocol wire frames and
//! delivers them to RTMP, RTSP and SRT servers. Each protocol client owns a
//! bounded frame cache between the producer and its sender thread.

pub mod auth;
mod cache;
mod client;
mod connection;
mod endpoint;
mod error;
pub mod nal;
pub mod packetizer;
mod stats;
mod wire;

pub use cache::{FrameCache, PushOutcome};
pub use client::{
    Attempt, Protocol, ProtocolClient, Rtmp, RtmpClient, RtmpSession, Rtsp, RtspClient,
    RtspSession, Session, Srt, SrtClient, SrtSession, StreamClient,
};
pub use connection::RetryPolicy;
pub use endpoint::StreamEndpoint;
pub use error::TransportError;
pub use stats::{BitrateMeter, Statistics, StreamStats};
pub use wire::{FrameKind, Track, WireFrame};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Retry delay used when the caller does not pick one.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;

/// Time allowed for the TCP or UDP connection and each handshake step.
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

/// How long RTSP waits for video parameter sets before ANNOUNCE.
pub const VIDEO_INFO_TIMEOUT_MS: u64 = 5000;

/// RTSP OPTIONS keepalive period.
pub const RTSP_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// RTMP liveness check period.
pub const RTMP_KEEPALIVE_INTERVAL_SECS: u64 = 5;

/// SRT keepalive period.
pub const SRT_KEEPALIVE_INTERVAL_MS: u64 = 1000;

/// MPEG-TS bytes carried by one SRT data packet (7 × 188).
pub const SRT_PAYLOAD_SIZE: usize = 1316;

/// Consecutive keepalive failures tolerated when server-alive checking is on.
pub const MAX_KEEPALIVE_FAILURES: u32 = 3;

/// Receive buffer of the sender loop.
pub const READ_BUFFER_SIZE: usize = 65536;

/// How often blocked workers look at their stop flag.
pub const STOP_POLL_INTERVAL_MS: u64 = 100;
