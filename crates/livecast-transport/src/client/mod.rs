//! Protocol clients.
//!
//! Every protocol shares one client core, [`ProtocolClient`]: it owns the
//! frame cache, the packetizer, the counters and the worker thread. The
//! protocol itself only supplies the handshake ([`Protocol::open`]) and
//! the framing of an established connection ([`Session`]).
//!
//! Each connection attempt runs on its own thread with a current-thread
//! tokio runtime. Terminal events of an attempt go through a latch so the
//! caller sees exactly one of `ConnectionSuccess`, `ConnectionFailed` or
//! `AuthError` per attempt, even when `disconnect()` races the handshake.

mod rtmp;
mod rtsp;
mod srt;

pub use rtmp::{Rtmp, RtmpSession};
pub use rtsp::{Rtsp, RtspSession};
pub use srt::{Srt, SrtSession};

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use livecast_ipc::{
    AudioInfo, ClientType, ConnectionEvent, ConnectionState, EncodedUnit, EventSink,
    StreamConfig, VideoInfo,
};
use parking_lot::{Mutex, RwLock};
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::cache::{FrameCache, PushOutcome};
use crate::connection::RetryPolicy;
use crate::endpoint::StreamEndpoint;
use crate::error::TransportError;
use crate::packetizer::MediaPacketizer;
use crate::stats::{BitrateMeter, Statistics, StreamStats};
use crate::wire::WireFrame;
use crate::{
    TransportResult, MAX_KEEPALIVE_FAILURES, READ_BUFFER_SIZE, STOP_POLL_INTERVAL_MS,
};

/// RTMP publisher.
pub type RtmpClient = ProtocolClient<Rtmp>;

/// RTSP publisher (ANNOUNCE / RECORD).
pub type RtspClient = ProtocolClient<Rtsp>;

/// SRT caller carrying MPEG-TS.
pub type SrtClient = ProtocolClient<Srt>;

/// Control surface shared by the three protocol clients.
///
/// Every call takes `&self`: producers, the session controller and the
/// statistics reader may sit on different threads.
pub trait StreamClient: Send + Sync {
    /// Protocol this client speaks.
    fn client_type(&self) -> ClientType;

    /// Start connecting to `url`. The outcome arrives as an event.
    fn connect(&self, url: &str);

    /// Stop streaming and release the connection. Joins the worker.
    fn disconnect(&self);

    /// Reconnect after `delay`, to `backup_url` when given. Returns true if
    /// a retry was started.
    fn retry(&self, delay: Duration, reason: &str, backup_url: Option<&str>) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Returns true while frames are being sent.
    fn is_streaming(&self) -> bool {
        self.state().is_connected()
    }

    fn set_video_info(&self, info: &VideoInfo);

    fn set_audio_info(&self, info: &AudioInfo);

    /// Packetize and queue a video unit. No-op unless connected.
    fn send_video(&self, unit: &EncodedUnit);

    /// Packetize and queue an audio unit. No-op unless connected.
    fn send_audio(&self, unit: &EncodedUnit);

    /// Returns true when cache occupancy exceeds `threshold_percent`.
    fn has_congestion(&self, threshold_percent: f32) -> bool;

    fn statistics(&self) -> Statistics;

    fn reset_sent_audio_frames(&self);

    fn reset_sent_video_frames(&self);

    fn reset_dropped_audio_frames(&self);

    fn reset_dropped_video_frames(&self);

    fn reset_bytes_sent(&self);

    /// Change the cache capacity. Rejected while streaming.
    fn resize_cache(&self, capacity: usize) -> TransportResult<()>;

    fn clear_cache(&self);

    /// Replace the whole configuration.
    fn apply_config(&self, config: &StreamConfig);

    fn set_authorization(&self, user: Option<&str>, password: Option<&str>);

    fn set_retries(&self, retries: u32);

    fn set_log(&self, enabled: bool);

    fn set_check_server_alive(&self, enabled: bool);

    fn set_only_audio(&self, enabled: bool);

    fn set_only_video(&self, enabled: bool);
}

/// Handshake and packetizer selection of one wire protocol.
pub trait Protocol: Send + Sync + 'static {
    /// Protocol tag reported by [`StreamClient::client_type`].
    const TYPE: ClientType;

    /// Packetizer producing this protocol's wire frames.
    type Packetizer: MediaPacketizer + 'static;

    /// An established connection.
    type Session: Session;

    /// Build the packetizer for `config`.
    fn packetizer(config: &StreamConfig) -> Self::Packetizer;

    /// Apply a configuration change to an existing packetizer.
    fn configure(_packetizer: &mut Self::Packetizer, _config: &StreamConfig) {}

    /// Open the transport and run the handshake up to the point where media
    /// can flow.
    fn open(attempt: &Attempt) -> impl Future<Output = TransportResult<Self::Session>>;
}

/// An established connection, driven by the send loop.
pub trait Session {
    /// Write one wire frame.
    fn send(&mut self, frame: &WireFrame) -> impl Future<Output = TransportResult<()>>;

    /// Read raw bytes from the peer. Must be cancel safe.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>>;

    /// Process bytes returned by [`Session::recv`].
    fn handle_input(&mut self, data: &[u8]) -> impl Future<Output = TransportResult<()>>;

    /// Protocol heartbeat, called every [`Session::keepalive_interval`].
    fn keepalive(&mut self) -> impl Future<Output = TransportResult<()>>;

    fn keepalive_interval(&self) -> Duration;

    /// Say goodbye to the server. Errors are ignored.
    fn close(&mut self) -> impl Future<Output = ()>;
}

/// State shared by a client and its worker.
pub(crate) struct Shared {
    config: RwLock<StreamConfig>,
    state: RwLock<ConnectionState>,
    cache: FrameCache,
    stats: StreamStats,
    events: EventSink,
    video_info: RwLock<Option<VideoInfo>>,
    audio_info: RwLock<Option<AudioInfo>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        debug!(state = state.name(), "State change");
        *self.state.write() = state;
    }

    /// Report a failed attempt. `cancelled` attempts leave the state alone,
    /// the caller of disconnect() owns it.
    fn report_failure(&self, latch: &AttemptLatch, err: TransportError, cancelled: bool) {
        let err = if cancelled {
            TransportError::Cancelled
        } else {
            err
        };
        let reason = err.to_string();
        if !cancelled {
            self.set_state(ConnectionState::Failed {
                reason: reason.clone(),
            });
        }
        if !latch.release() {
            return;
        }

        if err.is_auth() {
            warn!(%reason, "Authentication failed");
            self.events.emit(ConnectionEvent::AuthError);
        } else {
            warn!(%reason, "Connection failed");
            self.events.emit(ConnectionEvent::ConnectionFailed { reason });
        }
    }
}

/// Gate for the terminal event of one connection attempt.
#[derive(Debug, Default)]
pub(crate) struct AttemptLatch(AtomicBool);

impl AttemptLatch {
    /// Returns true for the first caller only.
    fn release(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Everything a protocol needs while connecting.
pub struct Attempt {
    /// Destination of this attempt.
    pub endpoint: StreamEndpoint,

    /// Configuration snapshot taken when the attempt started.
    pub config: StreamConfig,

    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    latch: Arc<AttemptLatch>,
}

impl Attempt {
    /// Credentials from the configuration, else from the URL.
    pub fn credentials(&self) -> Option<(String, String)> {
        self.config
            .credentials()
            .or_else(|| self.endpoint.credentials())
            .map(|(u, p)| (u.to_string(), p.to_string()))
    }

    /// Enter the authenticating state.
    pub fn authenticating(&self) {
        self.shared.set_state(ConnectionState::Authenticating);
    }

    /// Tell the caller the credentials were accepted.
    pub fn auth_succeeded(&self) {
        info!("Authentication accepted");
        self.shared.events.emit(ConnectionEvent::AuthSuccess);
    }

    /// Returns true once disconnect() or retry() cancelled this attempt.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Video format known so far.
    pub fn video_info(&self) -> Option<VideoInfo> {
        self.shared.video_info.read().clone()
    }

    /// Audio format known so far.
    pub fn audio_info(&self) -> Option<AudioInfo> {
        *self.shared.audio_info.read()
    }

    /// Wait until the encoder delivered its parameter sets.
    pub async fn wait_video_info(&self, timeout: Duration) -> Option<VideoInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(info) = self.video_info() {
                return Some(info);
            }
            if Instant::now() >= deadline || self.is_stopped() {
                return None;
            }
            sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS / 2)).await;
        }
    }

    /// Log per-packet details.
    pub fn logs(&self) -> bool {
        self.shared.config.read().logs
    }

    async fn stopped(&self) {
        while !self.is_stopped() {
            sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS)).await;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        self.shared.events.emit(event);
    }

    fn fail(&self, err: TransportError) {
        self.shared
            .report_failure(&self.latch, err, self.is_stopped());
    }
}

#[cfg(test)]
impl Attempt {
    /// Standalone attempt for handshake tests.
    pub(crate) fn for_test(url: &str, config: StreamConfig, events: EventSink) -> Self {
        let endpoint = match StreamEndpoint::parse(url) {
            Ok(endpoint) => endpoint,
            Err(e) => panic!("bad test url {}: {}", url, e),
        };
        Self {
            endpoint,
            shared: Arc::new(Shared {
                cache: FrameCache::new(config.cache_size),
                config: RwLock::new(config.clone()),
                state: RwLock::new(ConnectionState::Connecting),
                stats: StreamStats::new(),
                events,
                video_info: RwLock::new(None),
                audio_info: RwLock::new(None),
            }),
            config,
            stop: Arc::new(AtomicBool::new(false)),
            latch: Arc::new(AttemptLatch::default()),
        }
    }

    pub(crate) fn set_formats(&self, video: Option<VideoInfo>, audio: Option<AudioInfo>) {
        *self.shared.video_info.write() = video;
        *self.shared.audio_info.write() = audio;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }
}

struct Worker {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    latch: Arc<AttemptLatch>,
}

impl Worker {
    /// Signal the worker and wait for it to exit.
    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Sender thread panicked");
            }
        }
    }

    /// Stop without reporting the attempt to the caller.
    fn stop_silently(self) {
        self.latch.release();
        self.stop();
    }
}

/// The client core shared by every protocol.
pub struct ProtocolClient<P: Protocol> {
    shared: Arc<Shared>,
    packetizer: Mutex<P::Packetizer>,
    worker: Mutex<Option<Worker>>,
    retry: Mutex<RetryPolicy>,
}

impl<P: Protocol> ProtocolClient<P> {
    /// Create an idle client reporting to `events`.
    pub fn new(config: StreamConfig, events: EventSink) -> Self {
        let retry = RetryPolicy::new(config.retries);
        Self {
            packetizer: Mutex::new(P::packetizer(&config)),
            shared: Arc::new(Shared {
                cache: FrameCache::new(config.cache_size),
                config: RwLock::new(config),
                state: RwLock::new(ConnectionState::Idle),
                stats: StreamStats::new(),
                events,
                video_info: RwLock::new(None),
                audio_info: RwLock::new(None),
            }),
            worker: Mutex::new(None),
            retry: Mutex::new(retry),
        }
    }

    /// Copy of the current configuration.
    pub fn config(&self) -> StreamConfig {
        self.shared.config.read().clone()
    }

    /// Parse `url` and start a worker for it. The caller holds the worker
    /// slot, which must be empty.
    fn start(&self, slot: &mut Option<Worker>, url: &str, delay: Duration) {
        let latch = Arc::new(AttemptLatch::default());
        let endpoint = match StreamEndpoint::parse(url).and_then(|e| {
            if e.is_tls() {
                Err(TransportError::Unsupported(format!(
                    "{} requires TLS, which this client does not provide",
                    e.scheme
                )))
            } else {
                Ok(e)
            }
        }) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.shared.report_failure(&latch, e, false);
                return;
            }
        };

        let attempt = Attempt {
            endpoint,
            config: self.config(),
            shared: Arc::clone(&self.shared),
            stop: Arc::new(AtomicBool::new(false)),
            latch: Arc::clone(&latch),
        };
        let stop = Arc::clone(&attempt.stop);

        let spawned = std::thread::Builder::new()
            .name(format!("{}-sender", P::TYPE.name()))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        attempt.fail(TransportError::Io(e));
                        return;
                    }
                };
                runtime.block_on(run_attempt::<P>(attempt, delay));
            });

        match spawned {
            Ok(handle) => {
                *slot = Some(Worker {
                    handle: Some(handle),
                    stop,
                    latch,
                })
            }
            Err(e) => self.shared.report_failure(&latch, TransportError::Io(e), false),
        }
    }

    /// Queue the frames of one access unit. Losing key-frame data asks the
    /// caller for a new key-frame, once per unit.
    fn enqueue(&self, frames: Vec<WireFrame>) {
        let logs = self.shared.config.read().logs;
        let mut key_lost = false;
        for frame in frames {
            if let PushOutcome::Dropped {
                track,
                kind,
                incoming,
            } = self.shared.cache.push(frame)
            {
                if logs {
                    warn!(?track, ?kind, incoming, "Frame cache full, frame dropped");
                }
                key_lost |= kind.is_key();
            }
        }
        if key_lost {
            self.shared.events.emit(ConnectionEvent::KeyframeRequested);
        }
    }
}

impl<P: Protocol> StreamClient for ProtocolClient<P> {
    fn client_type(&self) -> ClientType {
        P::TYPE
    }

    #[instrument(name = "client_connect", skip(self), fields(protocol = P::TYPE.name()))]
    fn connect(&self, url: &str) {
        let mut worker = self.worker.lock();
        if let Some(previous) = worker.take() {
            debug!("Replacing running connection");
            previous.stop();
        }

        info!(%url, "Connecting");
        self.retry.lock().start_session(url);
        self.shared.cache.clear();
        self.packetizer.lock().reset();
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.events.emit(ConnectionEvent::ConnectionStarted {
            url: url.to_string(),
        });
        self.start(&mut worker, url, Duration::ZERO);
    }

    #[instrument(name = "client_disconnect", skip(self), fields(protocol = P::TYPE.name()))]
    fn disconnect(&self) {
        let mut slot = self.worker.lock();
        let worker = slot.take();
        if worker.is_none() && self.shared.state.read().is_idle() {
            return;
        }

        info!("Disconnecting");
        self.shared.set_state(ConnectionState::Disconnecting);
        if let Some(worker) = worker {
            worker.stop();
        }
        self.shared.cache.clear();
        self.packetizer.lock().reset();
        self.shared.set_state(ConnectionState::Idle);
        self.shared.events.emit(ConnectionEvent::Disconnect);
        info!("Disconnected");
    }

    #[instrument(name = "client_retry", skip(self), fields(protocol = P::TYPE.name()))]
    fn retry(&self, delay: Duration, reason: &str, backup_url: Option<&str>) -> bool {
        let state = self.state();
        if !state.is_failed() && !state.is_connected() {
            debug!(state = state.name(), "Retry ignored");
            return false;
        }

        let url = {
            let mut policy = self.retry.lock();
            if !policy.take_attempt(delay, reason) {
                info!(remaining = policy.remaining(), "Retry not allowed");
                return false;
            }
            match backup_url.or(policy.url()) {
                Some(url) => url.to_string(),
                None => return false,
            }
        };

        info!(%url, delay_ms = delay.as_millis() as u64, %reason, "Retrying");
        let mut worker = self.worker.lock();
        if let Some(previous) = worker.take() {
            previous.stop_silently();
        }
        self.shared.cache.clear();
        self.packetizer.lock().reset();
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.events.emit(ConnectionEvent::KeyframeRequested);
        self.start(&mut worker, &url, delay);
        true
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    fn set_video_info(&self, info: &VideoInfo) {
        *self.shared.video_info.write() = Some(info.clone());
        self.packetizer.lock().set_video_info(info);
    }

    fn set_audio_info(&self, info: &AudioInfo) {
        *self.shared.audio_info.write() = Some(*info);
        self.packetizer.lock().set_audio_info(info);
    }

    fn send_video(&self, unit: &EncodedUnit) {
        if !self.is_streaming() || self.shared.config.read().only_audio {
            return;
        }
        let frames = self.packetizer.lock().packetize_video(unit);
        self.enqueue(frames);
    }

    fn send_audio(&self, unit: &EncodedUnit) {
        if !self.is_streaming() || self.shared.config.read().only_video {
            return;
        }
        let frames = self.packetizer.lock().packetize_audio(unit);
        self.enqueue(frames);
    }

    fn has_congestion(&self, threshold_percent: f32) -> bool {
        self.shared.cache.occupancy_ratio() * 100.0 > threshold_percent
    }

    fn statistics(&self) -> Statistics {
        let cache = &self.shared.cache;
        let stats = &self.shared.stats;
        Statistics {
            sent_video_frames: stats.sent_video(),
            dropped_video_frames: cache.dropped_video(),
            sent_audio_frames: stats.sent_audio(),
            dropped_audio_frames: cache.dropped_audio(),
            sent_bytes: stats.sent_bytes(),
            cache_len: cache.len(),
            cache_capacity: cache.capacity(),
        }
    }

    fn reset_sent_audio_frames(&self) {
        self.shared.stats.reset_sent_audio();
    }

    fn reset_sent_video_frames(&self) {
        self.shared.stats.reset_sent_video();
    }

    fn reset_dropped_audio_frames(&self) {
        self.shared.cache.reset_dropped_audio();
    }

    fn reset_dropped_video_frames(&self) {
        self.shared.cache.reset_dropped_video();
    }

    fn reset_bytes_sent(&self) {
        self.shared.stats.reset_sent_bytes();
    }

    fn resize_cache(&self, capacity: usize) -> TransportResult<()> {
        if self.is_streaming() {
            return Err(TransportError::CacheResize(
                "cannot resize while streaming".to_string(),
            ));
        }
        self.shared.cache.resize(capacity)?;
        self.shared.config.write().cache_size = capacity;
        Ok(())
    }

    fn clear_cache(&self) {
        self.shared.cache.clear();
    }

    fn apply_config(&self, config: &StreamConfig) {
        if config.cache_size != self.shared.cache.capacity() {
            if let Err(e) = self.resize_cache(config.cache_size) {
                warn!("Keeping cache capacity {}: {}", self.shared.cache.capacity(), e);
            }
        }
        let capacity = self.shared.cache.capacity();
        {
            let mut current = self.shared.config.write();
            *current = config.clone();
            current.cache_size = capacity;
        }
        self.retry.lock().set_max_retries(config.retries);
        P::configure(&mut self.packetizer.lock(), config);
    }

    fn set_authorization(&self, user: Option<&str>, password: Option<&str>) {
        let mut config = self.shared.config.write();
        config.user = user.map(str::to_string);
        config.password = password.map(str::to_string);
    }

    fn set_retries(&self, retries: u32) {
        self.shared.config.write().retries = retries;
        self.retry.lock().set_max_retries(retries);
    }

    fn set_log(&self, enabled: bool) {
        self.shared.config.write().logs = enabled;
    }

    fn set_check_server_alive(&self, enabled: bool) {
        self.shared.config.write().check_server_alive = enabled;
    }

    fn set_only_audio(&self, enabled: bool) {
        self.shared.config.write().only_audio = enabled;
    }

    fn set_only_video(&self, enabled: bool) {
        self.shared.config.write().only_video = enabled;
    }
}

impl<P: Protocol> Drop for ProtocolClient<P> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_attempt<P: Protocol>(attempt: Attempt, delay: Duration) {
    if !delay.is_zero() {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = attempt.stopped() => {
                attempt.fail(TransportError::Cancelled);
                return;
            }
        }
        attempt.emit(ConnectionEvent::ConnectionStarted {
            url: attempt.endpoint.url().to_string(),
        });
    }

    attempt.shared.set_state(ConnectionState::Connecting);
    let opened = tokio::select! {
        result = P::open(&attempt) => result,
        _ = attempt.stopped() => Err(TransportError::Cancelled),
    };

    let mut session = match opened {
        Ok(session) => session,
        Err(e) => {
            attempt.fail(e);
            return;
        }
    };

    if attempt.is_stopped() {
        session.close().await;
        attempt.fail(TransportError::Cancelled);
        return;
    }

    attempt.shared.set_state(ConnectionState::Connected);
    if attempt.latch.release() {
        attempt.emit(ConnectionEvent::ConnectionSuccess);
    }
    info!(url = %attempt.endpoint.url(), "Streaming");

    let result = send_loop(&mut session, &attempt).await;
    session.close().await;

    if let Err(e) = result {
        if !attempt.is_stopped() {
            let reason = e.to_string();
            warn!(%reason, "Connection lost");
            attempt.shared.set_state(ConnectionState::Failed {
                reason: reason.clone(),
            });
            attempt.emit(ConnectionEvent::ConnectionFailed { reason });
        }
    }
}

/// Drain the cache into the session until stopped or failed.
async fn send_loop<S: Session>(session: &mut S, attempt: &Attempt) -> TransportResult<()> {
    let shared = &attempt.shared;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let period = session.keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stop_poll = interval(Duration::from_millis(STOP_POLL_INTERVAL_MS));
    let mut bitrate = BitrateMeter::default();
    let mut keepalive_failures = 0u32;

    loop {
        if attempt.is_stopped() {
            return Ok(());
        }

        tokio::select! {
            _ = shared.cache.notified() => {}
            read = session.recv(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Err(TransportError::ConnectionLost(
                        "connection closed by server".to_string(),
                    ));
                }
                session.handle_input(&buf[..n]).await?;
            }
            _ = keepalive.tick() => {
                match session.keepalive().await {
                    Ok(()) => keepalive_failures = 0,
                    Err(e) => {
                        keepalive_failures += 1;
                        warn!(failures = keepalive_failures, "Keepalive failed: {}", e);
                        if shared.config.read().check_server_alive
                            && keepalive_failures >= MAX_KEEPALIVE_FAILURES
                        {
                            return Err(TransportError::ConnectionLost(format!(
                                "server not alive: {}",
                                e
                            )));
                        }
                    }
                }
            }
            _ = stop_poll.tick() => {}
        }

        while let Some(frame) = shared.cache.pop() {
            if attempt.is_stopped() {
                return Ok(());
            }
            session.send(&frame).await?;
            shared.stats.record_sent(&frame);
            if shared.config.read().logs {
                trace!(
                    track = ?frame.track,
                    kind = ?frame.kind,
                    size = frame.len(),
                    timestamp = frame.timestamp,
                    "Frame sent"
                );
            }
            if let Some(bits_per_second) = bitrate.add(frame.len()) {
                attempt.emit(ConnectionEvent::NewBitrate { bits_per_second });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use livecast_ipc::event_channel;

    use crate::wire::{FrameKind, Track, WireFrame};

    fn key_frame(id: u8) -> WireFrame {
        WireFrame::new(Bytes::from(vec![id]), id as u32, FrameKind::KeyFrame, Track::Video)
    }

    #[test]
    fn test_one_keyframe_request_per_unit() {
        let (sink, events) = event_channel();
        let config = StreamConfig {
            cache_size: 2,
            ..StreamConfig::default()
        };
        let client = ProtocolClient::<Rtmp>::new(config, sink);

        client.enqueue((0..6).map(key_frame).collect());
        assert_eq!(events.try_recv(), Ok(ConnectionEvent::KeyframeRequested));
        assert!(events.try_recv().is_err());
        assert_eq!(client.statistics().dropped_video_frames, 4);

        client.enqueue(vec![key_frame(6)]);
        assert_eq!(events.try_recv(), Ok(ConnectionEvent::KeyframeRequested));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_delta_overflow_requests_nothing() {
        let (sink, events) = event_channel();
        let config = StreamConfig {
            cache_size: 1,
            ..StreamConfig::default()
        };
        let client = ProtocolClient::<Rtmp>::new(config, sink);

        let delta = |id: u8| {
            WireFrame::new(Bytes::from(vec![id]), id as u32, FrameKind::Video, Track::Video)
        };
        client.enqueue(vec![delta(0), delta(1), delta(2)]);
        assert!(events.try_recv().is_err());
        assert_eq!(client.statistics().dropped_video_frames, 2);
    }
}
