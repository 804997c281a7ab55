//! Bounded frame cache between packetizers and the send loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::wire::{FrameKind, Track, WireFrame};
use crate::TransportResult;

/// Result of a push into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored without loss.
    Queued,

    /// The cache was full and one frame was discarded.
    Dropped {
        /// Track of the discarded frame.
        track: Track,

        /// Kind of the discarded frame.
        kind: FrameKind,

        /// True if the incoming frame was discarded instead of a queued one.
        incoming: bool,
    },
}

struct Queue {
    frames: VecDeque<WireFrame>,
    capacity: usize,
}

/// Multi-producer, single-consumer bounded FIFO of wire frames.
///
/// Producers never block: when full, the oldest frame that is not part of a
/// key-frame is discarded to make room. Only when every queued frame is a
/// key-frame or configuration frame does the cache drop the incoming frame,
/// or the oldest key-frame when the incoming one is a key-frame too.
pub struct FrameCache {
    queue: Mutex<Queue>,
    notify: Notify,
    dropped_video: AtomicU64,
    dropped_audio: AtomicU64,
}

impl FrameCache {
    /// Create a cache holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue {
                frames: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
            }),
            notify: Notify::new(),
            dropped_video: AtomicU64::new(0),
            dropped_audio: AtomicU64::new(0),
        }
    }

    /// Insert a frame, applying the overflow policy when full.
    pub fn push(&self, frame: WireFrame) -> PushOutcome {
        let outcome = {
            let mut queue = self.queue.lock();
            if queue.frames.len() < queue.capacity {
                queue.frames.push_back(frame);
                PushOutcome::Queued
            } else if let Some(pos) = queue.frames.iter().position(|f| !f.kind.is_key()) {
                let dropped = queue.frames.remove(pos);
                queue.frames.push_back(frame);
                dropped.map_or(PushOutcome::Queued, |d| PushOutcome::Dropped {
                    track: d.track,
                    kind: d.kind,
                    incoming: false,
                })
            } else if !frame.kind.is_key() {
                PushOutcome::Dropped {
                    track: frame.track,
                    kind: frame.kind,
                    incoming: true,
                }
            } else {
                let dropped = match queue
                    .frames
                    .iter()
                    .position(|f| f.kind == FrameKind::KeyFrame)
                {
                    Some(pos) => queue.frames.remove(pos),
                    None => queue.frames.pop_front(),
                };
                queue.frames.push_back(frame);
                dropped.map_or(PushOutcome::Queued, |d| PushOutcome::Dropped {
                    track: d.track,
                    kind: d.kind,
                    incoming: false,
                })
            }
        };

        match outcome {
            PushOutcome::Dropped {
                track: Track::Video,
                ..
            } => {
                self.dropped_video.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Dropped {
                track: Track::Audio,
                ..
            } => {
                self.dropped_audio.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Queued => {}
        }

        self.notify.notify_one();
        outcome
    }

    /// Remove and return the oldest frame.
    pub fn pop(&self) -> Option<WireFrame> {
        self.queue.lock().frames.pop_front()
    }

    /// Wait until a producer pushes a frame.
    ///
    /// A push that happened since the last wait completes this immediately.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.queue.lock().frames.len()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().frames.is_empty()
    }

    /// Maximum number of queued frames.
    pub fn capacity(&self) -> usize {
        self.queue.lock().capacity
    }

    /// Current size over capacity, in `[0, 1]`.
    pub fn occupancy_ratio(&self) -> f32 {
        let queue = self.queue.lock();
        queue.frames.len() as f32 / queue.capacity as f32
    }

    /// Change the capacity.
    ///
    /// Queued frames are kept, so the new capacity must hold them.
    pub fn resize(&self, capacity: usize) -> TransportResult<()> {
        let mut queue = self.queue.lock();
        if capacity == 0 {
            return Err(TransportError::CacheResize(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if capacity < queue.frames.len() {
            return Err(TransportError::CacheResize(format!(
                "{} frames queued, more than the requested capacity {}",
                queue.frames.len(),
                capacity
            )));
        }
        queue.capacity = capacity;
        Ok(())
    }

    /// Discard every queued frame.
    pub fn clear(&self) {
        self.queue.lock().frames.clear();
    }

    /// Video frames discarded by the overflow policy.
    pub fn dropped_video(&self) -> u64 {
        self.dropped_video.load(Ordering::Relaxed)
    }

    /// Audio frames discarded by the overflow policy.
    pub fn dropped_audio(&self) -> u64 {
        self.dropped_audio.load(Ordering::Relaxed)
    }

    /// Reset the dropped video counter.
    pub fn reset_dropped_video(&self) {
        self.dropped_video.store(0, Ordering::Relaxed);
    }

    /// Reset the dropped audio counter.
    pub fn reset_dropped_audio(&self) {
        self.dropped_audio.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;

    fn frame(kind: FrameKind, id: u8) -> WireFrame {
        let track = if kind == FrameKind::Audio {
            Track::Audio
        } else {
            Track::Video
        };
        WireFrame::new(Bytes::from(vec![id]), id as u32, kind, track)
    }

    #[test]
    fn test_fifo_order() {
        let cache = FrameCache::new(4);
        for id in 0..3 {
            assert_eq!(cache.push(frame(FrameKind::Video, id)), PushOutcome::Queued);
        }
        assert_eq!(cache.pop().unwrap().timestamp, 0);
        assert_eq!(cache.pop().unwrap().timestamp, 1);
        assert_eq!(cache.pop().unwrap().timestamp, 2);
        assert!(cache.pop().is_none());
    }

    #[test]
    fn test_full_cache_drops_exactly_one() {
        let cache = FrameCache::new(2);
        cache.push(frame(FrameKind::Video, 0));
        cache.push(frame(FrameKind::Audio, 1));

        let outcome = cache.push(frame(FrameKind::Audio, 2));
        assert_eq!(
            outcome,
            PushOutcome::Dropped {
                track: Track::Video,
                kind: FrameKind::Video,
                incoming: false
            }
        );
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.dropped_video() + cache.dropped_audio(), 1);
    }

    #[test]
    fn test_keyframe_survives_overflow() {
        let cache = FrameCache::new(10);
        let mut id = 0u8;
        for _ in 0..9 {
            cache.push(frame(FrameKind::Video, id));
            id += 1;
        }
        let key_id = id;
        cache.push(frame(FrameKind::KeyFrame, key_id));
        id += 1;
        for _ in 0..5 {
            cache.push(frame(FrameKind::Audio, id));
            id += 1;
        }

        assert_eq!(cache.len(), 10);
        assert_eq!(cache.dropped_video() + cache.dropped_audio(), 5);

        let mut remaining = Vec::new();
        while let Some(f) = cache.pop() {
            remaining.push(f);
        }
        assert!(remaining
            .iter()
            .any(|f| f.kind == FrameKind::KeyFrame && f.timestamp == key_id as u32));
    }

    #[test]
    fn test_all_key_cache_drops_incoming_delta() {
        let cache = FrameCache::new(2);
        cache.push(frame(FrameKind::Config, 0));
        cache.push(frame(FrameKind::KeyFrame, 1));

        let outcome = cache.push(frame(FrameKind::Audio, 2));
        assert!(matches!(
            outcome,
            PushOutcome::Dropped {
                incoming: true,
                track: Track::Audio,
                ..
            }
        ));
        assert_eq!(cache.dropped_audio(), 1);
        assert_eq!(cache.pop().unwrap().timestamp, 0);
    }

    #[test]
    fn test_all_key_cache_replaces_oldest_key() {
        let cache = FrameCache::new(2);
        cache.push(frame(FrameKind::KeyFrame, 0));
        cache.push(frame(FrameKind::KeyFrame, 1));

        let outcome = cache.push(frame(FrameKind::KeyFrame, 2));
        assert!(matches!(
            outcome,
            PushOutcome::Dropped {
                kind: FrameKind::KeyFrame,
                incoming: false,
                ..
            }
        ));
        assert_eq!(cache.pop().unwrap().timestamp, 1);
        assert_eq!(cache.pop().unwrap().timestamp, 2);
    }

    #[test]
    fn test_full_key_cache_keeps_config() {
        let cache = FrameCache::new(2);
        cache.push(frame(FrameKind::Config, 0));
        cache.push(frame(FrameKind::KeyFrame, 1));

        let outcome = cache.push(frame(FrameKind::KeyFrame, 2));
        assert!(matches!(
            outcome,
            PushOutcome::Dropped {
                kind: FrameKind::KeyFrame,
                incoming: false,
                ..
            }
        ));
        assert_eq!(cache.dropped_video(), 1);
        assert_eq!(cache.pop().unwrap().kind, FrameKind::Config);
        assert_eq!(cache.pop().unwrap().timestamp, 2);
    }

    #[test]
    fn test_occupancy_ratio() {
        let cache = FrameCache::new(4);
        assert_eq!(cache.occupancy_ratio(), 0.0);
        cache.push(frame(FrameKind::Video, 0));
        assert_eq!(cache.occupancy_ratio(), 0.25);
    }

    #[test]
    fn test_resize_rules() {
        let cache = FrameCache::new(4);
        for id in 0..3 {
            cache.push(frame(FrameKind::Video, id));
        }
        assert!(cache.resize(0).is_err());
        assert!(cache.resize(2).is_err());
        cache.resize(8).unwrap();
        assert_eq!(cache.capacity(), 8);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_reset_dropped_audio_only() {
        let cache = FrameCache::new(1);
        cache.push(frame(FrameKind::Video, 0));
        cache.push(frame(FrameKind::Audio, 1));
        cache.push(frame(FrameKind::Video, 2));
        assert_eq!(cache.dropped_video(), 1);
        assert_eq!(cache.dropped_audio(), 1);

        cache.reset_dropped_audio();
        assert_eq!(cache.dropped_audio(), 0);
        assert_eq!(cache.dropped_video(), 1);
    }

    #[test]
    fn test_concurrent_producers_respect_capacity() {
        let cache = Arc::new(FrameCache::new(50));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for id in 0..100 {
                        cache.push(frame(FrameKind::Video, id));
                        assert!(cache.len() <= 50);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 50);
        assert_eq!(cache.dropped_video(), 350);
    }

    #[tokio::test]
    async fn test_notified_after_push() {
        let cache = FrameCache::new(4);
        cache.push(frame(FrameKind::Audio, 0));
        tokio::time::timeout(std::time::Duration::from_secs(1), cache.notified())
            .await
            .unwrap();
        assert!(cache.pop().is_some());
    }
}
