//! Command line publisher.
//!
//! Streams an H.264 or H.265 elementary stream file to an RTMP, RTSP or SRT
//! server at a fixed frame rate, retrying failed connections as configured.

mod source;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use crossbeam_channel::{RecvTimeoutError, Sender};
use livecast_engine::create_engine;
use livecast_ipc::{
    command_channel, event_channel, media_channel, ConnectionEvent, EncodedUnit, EngineCommand,
    MediaInput, RtspTransport, StreamConfig, VideoCodec,
};
use livecast_transport::nal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::source::AccessUnit;

/// How long to wait for the engine to acknowledge a connect.
const START_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Codec {
    H264,
    H265,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Tcp,
    Udp,
}

#[derive(Debug, Parser)]
#[command(name = "livecast", version, about = "Stream an elementary stream file to a live server")]
struct Args {
    /// Destination, e.g. rtmp://host/app/key, rtsp://host/path or srt://host:port?streamid=...
    url: String,

    /// Annex B video file
    #[arg(short, long)]
    file: PathBuf,

    /// TOML stream configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Video codec of the file
    #[arg(long, value_enum, default_value = "h264")]
    codec: Codec,

    /// Frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Restart from the beginning at the end of the file
    #[arg(long = "loop")]
    repeat: bool,

    /// Retries after a failed connection
    #[arg(long)]
    retries: Option<u32>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// SRT passphrase
    #[arg(long)]
    passphrase: Option<String>,

    /// RTSP media transport
    #[arg(long, value_enum)]
    transport: Option<Transport>,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livecast=info,livecast_engine=info,livecast_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Configuration file first, command line on top.
fn load_config(args: &Args) -> Result<StreamConfig> {
    let mut config = match args.config {
        Some(ref path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?
        }
        None => StreamConfig::default(),
    };

    config.video_codec = match args.codec {
        Codec::H264 => VideoCodec::H264,
        Codec::H265 => VideoCodec::H265,
    };
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    if args.user.is_some() {
        config.user.clone_from(&args.user);
    }
    if args.password.is_some() {
        config.password.clone_from(&args.password);
    }
    if args.passphrase.is_some() {
        config.passphrase.clone_from(&args.passphrase);
    }
    if let Some(transport) = args.transport {
        config.rtsp_transport = match transport {
            Transport::Tcp => RtspTransport::Tcp,
            Transport::Udp => RtspTransport::Udp,
        };
    }
    // The file carries no audio.
    config.only_video = true;
    config.only_audio = false;
    Ok(config)
}

/// Push access units into the media channel at `fps` while streaming.
fn feed(
    units: Vec<AccessUnit>,
    fps: u32,
    repeat: bool,
    media_tx: Sender<MediaInput>,
    streaming: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    done: Sender<EngineCommand>,
) {
    let period_us = 1_000_000 / u64::from(fps.max(1));
    let start = Instant::now();
    let mut frame: u64 = 0;

    'outer: loop {
        for unit in &units {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let pts_us = frame * period_us;
            let due = start + Duration::from_micros(pts_us);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            frame += 1;

            if !streaming.load(Ordering::Acquire) {
                continue;
            }
            let media = MediaInput::Video(EncodedUnit::video(
                unit.data.clone(),
                pts_us,
                unit.is_keyframe,
            ));
            if media_tx.send(media).is_err() {
                break 'outer;
            }
        }
        if !repeat {
            break;
        }
    }

    info!(frames = frame, "End of file");
    let _ = done.send(EngineCommand::Disconnect);
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = load_config(&args)?;

    let data = Bytes::from(
        std::fs::read(&args.file)
            .with_context(|| format!("failed to read {}", args.file.display()))?,
    );
    let video_info = nal::extract_video_info(&data, config.video_codec)
        .context("no parameter sets found in the video file")?;
    let units = source::access_units(&data, config.video_codec);
    if units.is_empty() {
        bail!("no pictures found in the video file");
    }
    info!(
        pictures = units.len(),
        keyframes = units.iter().filter(|u| u.is_keyframe).count(),
        "Video file loaded"
    );

    let (command_tx, command_rx) = command_channel();
    let (media_tx, media_rx) = media_channel();
    let (sink, events) = event_channel();

    let mut engine = create_engine(command_rx, media_rx, config.clone(), sink);
    let engine_thread = thread::Builder::new()
        .name("engine".to_string())
        .spawn(move || engine.run())
        .context("failed to start engine thread")?;

    command_tx.send(EngineCommand::Connect {
        url: args.url.clone(),
    })?;
    // Parameter sets go to the client selected by the connect.
    match events.recv_timeout(START_TIMEOUT) {
        Ok(ConnectionEvent::ConnectionStarted { url }) => info!(%url, "Connecting"),
        Ok(ConnectionEvent::ConnectionFailed { reason }) => {
            let _ = command_tx.send(EngineCommand::Shutdown);
            bail!("cannot connect to {}: {}", args.url, reason);
        }
        Ok(other) => debug!(?other, "Unexpected first event"),
        Err(_) => bail!("engine did not start the connection"),
    }
    media_tx.send(MediaInput::VideoInfo(video_info))?;

    let streaming = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let feeder = {
        let streaming = Arc::clone(&streaming);
        let stop = Arc::clone(&stop);
        let media_tx = media_tx.clone();
        let done = command_tx.clone();
        let (fps, repeat) = (args.fps, args.repeat);
        thread::Builder::new()
            .name("feeder".to_string())
            .spawn(move || feed(units, fps, repeat, media_tx, streaming, stop, done))
            .context("failed to start feeder thread")?
    };
    drop(media_tx);

    let mut retries_left = config.retries;
    let mut outcome = Ok(());
    loop {
        let event = match events.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            ConnectionEvent::ConnectionStarted { url } => info!(%url, "Connecting"),
            ConnectionEvent::ConnectionSuccess => {
                info!("Streaming");
                streaming.store(true, Ordering::Release);
            }
            ConnectionEvent::ConnectionFailed { reason } => {
                streaming.store(false, Ordering::Release);
                if retries_left == 0 {
                    error!(%reason, "Connection failed");
                    outcome = Err(anyhow::anyhow!("connection failed: {}", reason));
                    break;
                }
                retries_left -= 1;
                warn!(%reason, retries_left, delay_ms = config.retry_delay_ms, "Retrying");
                command_tx.send(EngineCommand::Retry {
                    delay_ms: config.retry_delay_ms,
                    reason,
                    backup_url: config.backup_url.clone(),
                })?;
            }
            ConnectionEvent::AuthError => {
                streaming.store(false, Ordering::Release);
                outcome = Err(anyhow::anyhow!("server rejected the credentials"));
                break;
            }
            ConnectionEvent::AuthSuccess => info!("Authenticated"),
            ConnectionEvent::NewBitrate { bits_per_second } => {
                debug!(kbps = bits_per_second / 1000, "Bitrate")
            }
            ConnectionEvent::KeyframeRequested => debug!("Key frame requested"),
            ConnectionEvent::Disconnect => {
                info!("Disconnected");
                break;
            }
        }
    }

    stop.store(true, Ordering::Release);
    let _ = command_tx.send(EngineCommand::Shutdown);
    match engine_thread.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Engine error: {}", e),
        Err(_) => error!("Engine thread panicked"),
    }
    if feeder.join().is_err() {
        error!("Feeder thread panicked");
    }
    outcome
}
