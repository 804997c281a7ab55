//! Per-client frame counters and bitrate measurement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::wire::{Track, WireFrame};

/// Sent-frame counters of one protocol client.
///
/// Counters only grow; they are cleared by the explicit reset calls and
/// never by a reconnection.
#[derive(Debug, Default)]
pub struct StreamStats {
    sent_video: AtomicU64,
    sent_audio: AtomicU64,
    sent_bytes: AtomicU64,
}

impl StreamStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame written to the transport.
    pub fn record_sent(&self, frame: &WireFrame) {
        match frame.track {
            Track::Video => self.sent_video.fetch_add(1, Ordering::Relaxed),
            Track::Audio => self.sent_audio.fetch_add(1, Ordering::Relaxed),
        };
        self.sent_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
    }

    pub fn sent_video(&self) -> u64 {
        self.sent_video.load(Ordering::Relaxed)
    }

    pub fn sent_audio(&self) -> u64 {
        self.sent_audio.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn reset_sent_video(&self) {
        self.sent_video.store(0, Ordering::Relaxed);
    }

    pub fn reset_sent_audio(&self) {
        self.sent_audio.store(0, Ordering::Relaxed);
    }

    pub fn reset_sent_bytes(&self) {
        self.sent_bytes.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of a client's counters and cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub sent_video_frames: u64,
    pub dropped_video_frames: u64,
    pub sent_audio_frames: u64,
    pub dropped_audio_frames: u64,
    pub sent_bytes: u64,
    pub cache_len: usize,
    pub cache_capacity: usize,
}

/// Measures outgoing bits per second over one-second windows.
#[derive(Debug)]
pub struct BitrateMeter {
    bytes: u64,
    window_start: Instant,
    window: Duration,
}

impl Default for BitrateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl BitrateMeter {
    /// Create a meter reporting once per `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            bytes: 0,
            window_start: Instant::now(),
            window,
        }
    }

    /// Account `bytes` sent now. Returns the bitrate when a window closes.
    pub fn add(&mut self, bytes: usize) -> Option<u64> {
        self.add_at(bytes, Instant::now())
    }

    fn add_at(&mut self, bytes: usize, now: Instant) -> Option<u64> {
        self.bytes += bytes as u64;
        let elapsed = now.duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }

        let bps = (self.bytes as f64 * 8.0 / elapsed.as_secs_f64()) as u64;
        self.bytes = 0;
        self.window_start = now;
        Some(bps)
    }

    /// Start a new window.
    pub fn reset(&mut self) {
        self.bytes = 0;
        self.window_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameKind;
    use bytes::Bytes;

    fn frame(track: Track, len: usize) -> WireFrame {
        let kind = match track {
            Track::Video => FrameKind::Video,
            Track::Audio => FrameKind::Audio,
        };
        WireFrame::new(Bytes::from(vec![0u8; len]), 0, kind, track)
    }

    #[test]
    fn test_counters_per_track() {
        let stats = StreamStats::new();
        stats.record_sent(&frame(Track::Video, 100));
        stats.record_sent(&frame(Track::Video, 50));
        stats.record_sent(&frame(Track::Audio, 10));

        assert_eq!(stats.sent_video(), 2);
        assert_eq!(stats.sent_audio(), 1);
        assert_eq!(stats.sent_bytes(), 160);
    }

    #[test]
    fn test_reset_is_per_counter() {
        let stats = StreamStats::new();
        stats.record_sent(&frame(Track::Video, 1));
        stats.record_sent(&frame(Track::Audio, 1));

        stats.reset_sent_audio();
        assert_eq!(stats.sent_audio(), 0);
        assert_eq!(stats.sent_video(), 1);
        assert_eq!(stats.sent_bytes(), 2);
    }

    #[test]
    fn test_bitrate_window() {
        let mut meter = BitrateMeter::new(Duration::from_secs(1));
        let start = meter.window_start;

        assert_eq!(meter.add_at(1000, start + Duration::from_millis(500)), None);
        let bps = meter.add_at(1500, start + Duration::from_secs(2)).unwrap();
        assert_eq!(bps, 10_000);
        // the next window starts empty
        assert_eq!(meter.add_at(10, start + Duration::from_millis(2500)), None);
    }
}
