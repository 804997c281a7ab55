//! Command loop and media pump around the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use livecast_ipc::{EngineCommand, EventSink, MediaInput, StreamConfig};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::dispatcher::StreamDispatcher;
use crate::error::{EngineError, EngineResult};

/// Poll period of both loops.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Period of the statistics log line while streaming.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// The streaming engine.
///
/// Session commands are handled on the thread calling [`Engine::run`].
/// Encoded media is pumped into the dispatcher on a separate thread so a
/// slow `connect()` or `disconnect()` never stalls the producer.
pub struct Engine {
    command_rx: Receiver<EngineCommand>,
    media_rx: Receiver<MediaInput>,
    dispatcher: Arc<StreamDispatcher>,
    congestion_threshold: f32,
    pump_thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
}

impl Engine {
    /// Create an engine. Events of every client go to `events`.
    pub fn new(
        command_rx: Receiver<EngineCommand>,
        media_rx: Receiver<MediaInput>,
        config: StreamConfig,
        events: EventSink,
    ) -> Self {
        Self {
            command_rx,
            media_rx,
            congestion_threshold: config.congestion_threshold_percent,
            dispatcher: Arc::new(StreamDispatcher::new(config, events)),
            pump_thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared handle on the dispatcher, for queries.
    pub fn dispatcher(&self) -> Arc<StreamDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Run the engine until `Shutdown` or until the command channel closes
    /// (blocking).
    #[instrument(name = "engine_run", skip(self))]
    pub fn run(&mut self) -> EngineResult<()> {
        info!("Engine starting");
        self.start_media_pump()?;

        let mut last_log = Instant::now();
        let mut congested = false;
        loop {
            match self.command_rx.recv_timeout(POLL_INTERVAL) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.dispatcher.is_streaming() {
                        continue;
                    }
                    let now_congested = self.dispatcher.has_congestion(self.congestion_threshold);
                    if now_congested != congested {
                        congested = now_congested;
                        if congested {
                            warn!(threshold = self.congestion_threshold, "Stream congested");
                        } else {
                            info!("Congestion cleared");
                        }
                    }
                    if last_log.elapsed() >= STATS_LOG_INTERVAL {
                        let stats = self.dispatcher.statistics();
                        info!(
                            "Stream stats: video sent={} dropped={}, audio sent={} dropped={}, bytes={}, cache={}/{}",
                            stats.sent_video_frames,
                            stats.dropped_video_frames,
                            stats.sent_audio_frames,
                            stats.dropped_audio_frames,
                            stats.sent_bytes,
                            stats.cache_len,
                            stats.cache_capacity
                        );
                        last_log = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Command channel disconnected, shutting down");
                    self.dispatcher.disconnect();
                    break;
                }
            }
        }

        self.stop_media_pump();
        info!("Engine stopped");
        Ok(())
    }

    /// Handle a command. Returns false if the engine should stop.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            EngineCommand::Connect { url } => self.dispatcher.connect(&url),
            EngineCommand::Disconnect => self.dispatcher.disconnect(),
            EngineCommand::Retry {
                delay_ms,
                reason,
                backup_url,
            } => {
                let started = self.dispatcher.retry(
                    Duration::from_millis(delay_ms),
                    &reason,
                    backup_url.as_deref(),
                );
                if !started {
                    info!(%reason, "Retry not started");
                }
            }
            EngineCommand::ApplyConfig(config) => {
                self.congestion_threshold = config.congestion_threshold_percent;
                self.dispatcher.apply_config(&config);
            }
            EngineCommand::Shutdown => {
                self.dispatcher.disconnect();
                return false;
            }
        }

        true
    }

    fn start_media_pump(&mut self) -> EngineResult<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let media_rx = self.media_rx.clone();
        let should_stop = Arc::clone(&self.should_stop);
        should_stop.store(false, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("media-pump".to_string())
            .spawn(move || media_pump(dispatcher, media_rx, should_stop))
            .map_err(|e| EngineError::Thread("media pump", e))?;
        self.pump_thread = Some(handle);
        Ok(())
    }

    fn stop_media_pump(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.pump_thread.take() {
            if handle.join().is_err() {
                error!("Media pump panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_media_pump();
    }
}

/// Move encoded media from the channel into the active client.
fn media_pump(
    dispatcher: Arc<StreamDispatcher>,
    media_rx: Receiver<MediaInput>,
    should_stop: Arc<AtomicBool>,
) {
    debug!("Media pump starting");
    let mut units: u64 = 0;

    while !should_stop.load(Ordering::SeqCst) {
        match media_rx.recv_timeout(POLL_INTERVAL) {
            Ok(MediaInput::VideoInfo(info)) => {
                debug!(codec = ?info.codec(), "Video info received");
                dispatcher.set_video_info(&info);
            }
            Ok(MediaInput::AudioInfo(info)) => {
                debug!(codec = ?info.codec, rate = info.sample_rate, "Audio info received");
                dispatcher.set_audio_info(&info);
            }
            Ok(MediaInput::Video(unit)) => {
                units += 1;
                trace!(pts_us = unit.pts_us, key = unit.is_keyframe(), "Video unit");
                dispatcher.send_video(&unit);
            }
            Ok(MediaInput::Audio(unit)) => {
                units += 1;
                dispatcher.send_audio(&unit);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Media channel disconnected");
                break;
            }
        }
    }

    info!(units, "Media pump stopped");
}
