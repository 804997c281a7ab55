//! Protocol-agnostic facade over the three protocol clients.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use livecast_ipc::{
    AudioInfo, ClientType, ConnectionEvent, ConnectionState, EncodedUnit, EventSink,
    StreamConfig, VideoInfo,
};
use livecast_transport::{RtmpClient, RtspClient, SrtClient, Statistics, StreamClient};
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, EngineResult};

const NONE: u8 = 0;
const RTMP: u8 = 1;
const RTSP: u8 = 2;
const SRT: u8 = 3;

fn tag(client_type: ClientType) -> u8 {
    match client_type {
        ClientType::Rtmp => RTMP,
        ClientType::Rtsp => RTSP,
        ClientType::Srt => SRT,
    }
}

/// Routes every call to the client selected by the last `connect` URL.
///
/// Configuration is broadcast to all clients so settings applied before a
/// protocol is chosen still take effect. Queries answer from the active
/// client, or a neutral default when none is active. Media goes to the
/// active client only.
pub struct StreamDispatcher {
    rtmp: RtmpClient,
    rtsp: RtspClient,
    srt: SrtClient,
    active: AtomicU8,
    events: EventSink,
}

impl StreamDispatcher {
    /// Create the three clients, all reporting to `events`.
    pub fn new(config: StreamConfig, events: EventSink) -> Self {
        Self {
            rtmp: RtmpClient::new(config.clone(), events.clone()),
            rtsp: RtspClient::new(config.clone(), events.clone()),
            srt: SrtClient::new(config, events.clone()),
            active: AtomicU8::new(NONE),
            events,
        }
    }

    fn client(&self, client_type: ClientType) -> &dyn StreamClient {
        match client_type {
            ClientType::Rtmp => &self.rtmp,
            ClientType::Rtsp => &self.rtsp,
            ClientType::Srt => &self.srt,
        }
    }

    fn clients(&self) -> [&dyn StreamClient; 3] {
        [&self.rtmp, &self.rtsp, &self.srt]
    }

    /// Protocol of the active client.
    pub fn active_type(&self) -> Option<ClientType> {
        match self.active.load(Ordering::Acquire) {
            RTMP => Some(ClientType::Rtmp),
            RTSP => Some(ClientType::Rtsp),
            SRT => Some(ClientType::Srt),
            _ => None,
        }
    }

    fn active(&self) -> Option<&dyn StreamClient> {
        self.active_type().map(|t| self.client(t))
    }

    /// Select the client for `url` and connect it.
    ///
    /// An unrecognised scheme disconnects the previous client and leaves
    /// none selected.
    #[instrument(name = "dispatch_connect", skip(self))]
    pub fn connect(&self, url: &str) {
        let Some(client_type) = ClientType::from_url(url) else {
            let err = EngineError::UnsupportedProtocol(url.to_string());
            warn!(%url, "{}", err);
            if let Some(previous) = self.active() {
                previous.disconnect();
            }
            self.active.store(NONE, Ordering::Release);
            self.events.emit(ConnectionEvent::ConnectionFailed {
                reason: err.to_string(),
            });
            return;
        };

        if let Some(previous) = self.active_type() {
            if previous != client_type {
                info!(from = previous.name(), to = client_type.name(), "Switching protocol");
                self.client(previous).disconnect();
            }
        }

        debug!(protocol = client_type.name(), "Client selected");
        self.active.store(tag(client_type), Ordering::Release);
        self.client(client_type).connect(url);
    }

    /// Disconnect the active client and clear the selection.
    #[instrument(name = "dispatch_disconnect", skip(self))]
    pub fn disconnect(&self) {
        if let Some(client) = self.active() {
            client.disconnect();
        }
        self.active.store(NONE, Ordering::Release);
    }

    /// Retry the active client. Returns false when nothing was started.
    pub fn retry(&self, delay: Duration, reason: &str, backup_url: Option<&str>) -> bool {
        match self.active() {
            Some(client) => client.retry(delay, reason, backup_url),
            None => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.active()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn is_streaming(&self) -> bool {
        self.active().is_some_and(|c| c.is_streaming())
    }

    pub fn set_video_info(&self, info: &VideoInfo) {
        if let Some(client) = self.active() {
            client.set_video_info(info);
        }
    }

    pub fn set_audio_info(&self, info: &AudioInfo) {
        if let Some(client) = self.active() {
            client.set_audio_info(info);
        }
    }

    pub fn send_video(&self, unit: &EncodedUnit) {
        if let Some(client) = self.active() {
            client.send_video(unit);
        }
    }

    pub fn send_audio(&self, unit: &EncodedUnit) {
        if let Some(client) = self.active() {
            client.send_audio(unit);
        }
    }

    /// Returns true when the active client's cache is above `threshold_percent`.
    pub fn has_congestion(&self, threshold_percent: f32) -> bool {
        self.active()
            .is_some_and(|c| c.has_congestion(threshold_percent))
    }

    pub fn statistics(&self) -> Statistics {
        self.active().map(|c| c.statistics()).unwrap_or_default()
    }

    pub fn reset_sent_audio_frames(&self) {
        self.clients().iter().for_each(|c| c.reset_sent_audio_frames());
    }

    pub fn reset_sent_video_frames(&self) {
        self.clients().iter().for_each(|c| c.reset_sent_video_frames());
    }

    pub fn reset_dropped_audio_frames(&self) {
        self.clients().iter().for_each(|c| c.reset_dropped_audio_frames());
    }

    pub fn reset_dropped_video_frames(&self) {
        self.clients().iter().for_each(|c| c.reset_dropped_video_frames());
    }

    pub fn reset_bytes_sent(&self) {
        self.clients().iter().for_each(|c| c.reset_bytes_sent());
    }

    /// Resize every client's cache. All clients are tried; the first
    /// refusal is returned.
    pub fn resize_cache(&self, capacity: usize) -> EngineResult<()> {
        let mut result = Ok(());
        for client in self.clients() {
            if let Err(e) = client.resize_cache(capacity) {
                if result.is_ok() {
                    result = Err(EngineError::from(e));
                }
            }
        }
        result
    }

    pub fn clear_cache(&self) {
        self.clients().iter().for_each(|c| c.clear_cache());
    }

    pub fn apply_config(&self, config: &StreamConfig) {
        self.clients().iter().for_each(|c| c.apply_config(config));
    }

    pub fn set_authorization(&self, user: Option<&str>, password: Option<&str>) {
        self.clients()
            .iter()
            .for_each(|c| c.set_authorization(user, password));
    }

    pub fn set_retries(&self, retries: u32) {
        self.clients().iter().for_each(|c| c.set_retries(retries));
    }

    pub fn set_log(&self, enabled: bool) {
        self.clients().iter().for_each(|c| c.set_log(enabled));
    }

    pub fn set_check_server_alive(&self, enabled: bool) {
        self.clients()
            .iter()
            .for_each(|c| c.set_check_server_alive(enabled));
    }

    pub fn set_only_audio(&self, enabled: bool) {
        self.clients().iter().for_each(|c| c.set_only_audio(enabled));
    }

    pub fn set_only_video(&self, enabled: bool) {
        self.clients().iter().for_each(|c| c.set_only_video(enabled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    use bytes::Bytes;
    use livecast_ipc::event_channel;

    /// Answer every RTSP request with 200 and swallow interleaved packets
    /// until the client hangs up. Returns the listening port.
    fn spawn_rtsp_responder() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut input: Vec<u8> = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                loop {
                    if input.first() == Some(&b'$') {
                        if input.len() < 4 {
                            break;
                        }
                        let len = 4 + u16::from_be_bytes([input[2], input[3]]) as usize;
                        if input.len() < len {
                            break;
                        }
                        input.drain(..len);
                        continue;
                    }
                    let Some(end) = input.windows(4).position(|w| w == b"\r\n\r\n") else {
                        break;
                    };
                    let head = String::from_utf8_lossy(&input[..end]).into_owned();
                    let body = head
                        .lines()
                        .find_map(|l| l.strip_prefix("Content-Length: "))
                        .map_or(0, |v| v.trim().parse::<usize>().unwrap());
                    if input.len() < end + 4 + body {
                        break;
                    }
                    let cseq = head
                        .lines()
                        .find_map(|l| l.strip_prefix("CSeq: "))
                        .unwrap_or("0")
                        .to_string();
                    input.drain(..end + 4 + body);
                    let reply = format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: 1\r\n\r\n", cseq);
                    if stream.write_all(reply.as_bytes()).is_err() {
                        return;
                    }
                }
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => input.extend_from_slice(&buf[..n]),
                }
            }
        });
        port
    }

    fn idle(stats: Statistics) -> bool {
        stats.cache_len == 0
            && stats.sent_video_frames == 0
            && stats.dropped_video_frames == 0
            && stats.sent_bytes == 0
    }

    #[test]
    fn test_media_reaches_active_client_only() {
        let port = spawn_rtsp_responder();
        let (sink, events) = event_channel();
        let dispatcher = StreamDispatcher::new(StreamConfig::default(), sink);

        dispatcher.connect(&format!("rtsp://127.0.0.1:{}/live", port));
        dispatcher.set_video_info(&VideoInfo::new(
            Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
            None,
        ));
        loop {
            match events.recv_timeout(Duration::from_secs(10)).unwrap() {
                ConnectionEvent::ConnectionSuccess => break,
                ConnectionEvent::ConnectionFailed { reason } => panic!("{}", reason),
                _ => {}
            }
        }

        dispatcher.send_video(&EncodedUnit::video(
            vec![0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00],
            0,
            true,
        ));
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let stats = dispatcher.rtsp.statistics();
            if stats.sent_video_frames + stats.cache_len as u64 > 0 {
                break;
            }
            assert!(Instant::now() < deadline, "video never reached the RTSP client");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(idle(dispatcher.rtmp.statistics()));
        assert!(idle(dispatcher.srt.statistics()));

        dispatcher.disconnect();
    }

    #[test]
    fn test_unsupported_scheme_disconnects_active_client() {
        let port = spawn_rtsp_responder();
        let (sink, events) = event_channel();
        let dispatcher = StreamDispatcher::new(StreamConfig::default(), sink);

        dispatcher.connect(&format!("rtsp://127.0.0.1:{}/live", port));
        assert_eq!(dispatcher.active_type(), Some(ClientType::Rtsp));

        dispatcher.connect("foo://bar");
        assert_eq!(dispatcher.active_type(), None);
        assert_eq!(dispatcher.rtsp.state(), ConnectionState::Idle);

        let mut failed = false;
        while let Ok(event) = events.recv_timeout(Duration::from_secs(1)) {
            if event
                == (ConnectionEvent::ConnectionFailed {
                    reason: "unsupported protocol. Only support rtmp, rtsp and srt".to_string(),
                })
            {
                failed = true;
            }
        }
        assert!(failed);
    }

    #[test]
    fn test_unsupported_scheme() {
        let (sink, events) = event_channel();
        let dispatcher = StreamDispatcher::new(StreamConfig::default(), sink);

        dispatcher.connect("foo://bar");

        assert_eq!(dispatcher.active_type(), None);
        assert_eq!(
            events.try_recv().unwrap(),
            ConnectionEvent::ConnectionFailed {
                reason: "unsupported protocol. Only support rtmp, rtsp and srt".to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_queries_default_without_client() {
        let (sink, events) = event_channel();
        let dispatcher = StreamDispatcher::new(StreamConfig::default(), sink);

        dispatcher.send_video(&EncodedUnit::video(vec![0, 0, 0, 1, 0x65], 0, true));
        dispatcher.send_audio(&EncodedUnit::audio(vec![1, 2, 3], 0));

        assert!(!dispatcher.is_streaming());
        assert!(!dispatcher.has_congestion(0.0));
        assert_eq!(dispatcher.state(), ConnectionState::Idle);
        assert_eq!(dispatcher.statistics(), Statistics::default());
        assert!(!dispatcher.retry(Duration::ZERO, "test", None));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_resize_broadcasts() {
        let (sink, _events) = event_channel();
        let dispatcher = StreamDispatcher::new(StreamConfig::default(), sink);

        dispatcher.resize_cache(32).unwrap();
        assert_eq!(dispatcher.rtmp.statistics().cache_capacity, 32);
        assert_eq!(dispatcher.rtsp.statistics().cache_capacity, 32);
        assert_eq!(dispatcher.srt.statistics().cache_capacity, 32);
        assert!(dispatcher.resize_cache(0).is_err());
    }

    #[test]
    fn test_disconnect_without_client_is_silent() {
        let (sink, events) = event_channel();
        let dispatcher = StreamDispatcher::new(StreamConfig::default(), sink);

        dispatcher.disconnect();
        assert!(events.try_recv().is_err());
    }
}
