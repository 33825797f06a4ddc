//! Audio ingress demultiplexer
//!
//! Receives decoded frames from the media transport callback, normalizes to
//! the pipeline format (16 kHz mono i16, frames ≤ 20 ms), and routes each
//! frame to its participant's bounded queue. Overflow drops the OLDEST
//! frames: for conversational latency, fresh audio beats complete audio.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use confab_core::{AudioFrame, ParticipantId, PIPELINE_SAMPLE_RATE_HZ};

use crate::resample::{downmix_to_mono, LinearResampler};
use crate::TransportError;

/// Ingress configuration
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Queue capacity per participant, in milliseconds of audio
    pub queue_capacity_ms: u64,
    /// Frames are re-cut to at most this duration
    pub max_frame_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            queue_capacity_ms: 1000,
            max_frame_ms: 20,
        }
    }
}

/// Bounded frame queue with drop-oldest overflow.
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    available: Notify,
    capacity_frames: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl FrameQueue {
    fn new(capacity_frames: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            capacity_frames: capacity_frames.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame, evicting the oldest if full.
    pub fn push(&self, frame: AudioFrame) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut frames = self.frames.lock();
            while frames.len() >= self.capacity_frames {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        }
        self.available.notify_one();
    }

    /// Dequeue the next frame, waiting if empty. Returns `None` once the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            let notified = self.available.notified();
            if let Some(frame) = self.frames.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue; pending frames remain poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }

    /// Frames dropped to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

struct ParticipantIngress {
    queue: Arc<FrameQueue>,
    resampler: Mutex<LinearResampler>,
}

/// Routes media-transport audio to per-participant queues.
pub struct IngressRouter {
    config: IngressConfig,
    participants: RwLock<HashMap<ParticipantId, ParticipantIngress>>,
}

impl IngressRouter {
    pub fn new(config: IngressConfig) -> Self {
        Self {
            config,
            participants: RwLock::new(HashMap::new()),
        }
    }

    /// Register a participant and hand back its frame queue.
    pub fn register(&self, identity: ParticipantId) -> Arc<FrameQueue> {
        let capacity_frames =
            (self.config.queue_capacity_ms / self.config.max_frame_ms.max(1)) as usize;
        let queue = Arc::new(FrameQueue::new(capacity_frames));
        self.participants.write().insert(
            identity,
            ParticipantIngress {
                queue: Arc::clone(&queue),
                resampler: Mutex::new(LinearResampler::new(
                    PIPELINE_SAMPLE_RATE_HZ,
                    PIPELINE_SAMPLE_RATE_HZ,
                )),
            },
        );
        queue
    }

    /// Unregister a participant and close its queue.
    pub fn unregister(&self, identity: &ParticipantId) {
        if let Some(entry) = self.participants.write().remove(identity) {
            entry.queue.close();
        }
    }

    /// Route one incoming frame: downmix, resample to 16 kHz, re-cut to
    /// ≤ `max_frame_ms`, and enqueue.
    pub fn route(
        &self,
        identity: &ParticipantId,
        pcm: &[i16],
        sample_rate_hz: u32,
        channels: u8,
        capture_ts_ms: u64,
    ) -> Result<(), TransportError> {
        let participants = self.participants.read();
        let entry = participants
            .get(identity)
            .ok_or_else(|| TransportError::ParticipantUnknown(identity.clone()))?;

        let mono = downmix_to_mono(pcm, channels);
        let normalized = {
            let mut resampler = entry.resampler.lock();
            // Source rate can change mid-stream (e.g. a SIP renegotiation);
            // restart the interpolator when it does.
            if resampler.src_rate() != sample_rate_hz {
                *resampler = LinearResampler::new(sample_rate_hz, PIPELINE_SAMPLE_RATE_HZ);
            }
            resampler.process(&mono)
        };

        let samples_per_cut =
            (PIPELINE_SAMPLE_RATE_HZ as u64 * self.config.max_frame_ms / 1000) as usize;
        let mut offset_ms = 0u64;
        for chunk in normalized.chunks(samples_per_cut.max(1)) {
            entry.queue.push(AudioFrame::new(
                identity.clone(),
                chunk.to_vec(),
                PIPELINE_SAMPLE_RATE_HZ,
                capture_ts_ms + offset_ms,
            ));
            offset_ms += (chunk.len() as u64 * 1000) / PIPELINE_SAMPLE_RATE_HZ as u64;
        }

        Ok(())
    }

    /// Frames dropped for a participant, if registered.
    pub fn dropped_frames(&self, identity: &ParticipantId) -> Option<u64> {
        self.participants
            .read()
            .get(identity)
            .map(|e| e.queue.dropped())
    }

    pub fn participant_count(&self) -> usize {
        self.participants.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> ParticipantId {
        ParticipantId::from("alice")
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let router = IngressRouter::new(IngressConfig::default());
        let err = router.route(&alice(), &[0i16; 320], 16_000, 1, 0);
        assert!(matches!(err, Err(TransportError::ParticipantUnknown(_))));
    }

    #[tokio::test]
    async fn test_route_recuts_large_frames() {
        let router = IngressRouter::new(IngressConfig::default());
        let queue = router.register(alice());

        // 40ms at 16kHz gets split into two 20ms frames
        router.route(&alice(), &[0i16; 640], 16_000, 1, 100).unwrap();
        let first = queue.pop().await.unwrap();
        let second = queue.pop().await.unwrap();
        assert_eq!(first.duration_ms(), 20);
        assert_eq!(first.capture_ts_ms, 100);
        assert_eq!(second.capture_ts_ms, 120);
    }

    #[tokio::test]
    async fn test_route_resamples_to_pipeline_rate() {
        let router = IngressRouter::new(IngressConfig::default());
        let queue = router.register(alice());

        // 20ms of 48kHz stereo
        router.route(&alice(), &[100i16; 1920], 48_000, 2, 0).unwrap();
        let frame = queue.pop().await.unwrap();
        assert_eq!(frame.sample_rate_hz, 16_000);
        assert!(frame.duration_ms() <= 20);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let router = IngressRouter::new(IngressConfig {
            queue_capacity_ms: 60,
            max_frame_ms: 20,
        });
        let queue = router.register(alice());

        for i in 0..5 {
            router
                .route(&alice(), &[i as i16; 320], 16_000, 1, i * 20)
                .unwrap();
        }
        // Capacity is 3 frames; the two oldest were dropped
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(router.dropped_frames(&alice()), Some(2));
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let router = IngressRouter::new(IngressConfig::default());
        let queue = router.register(alice());
        router.route(&alice(), &[0i16; 160], 16_000, 1, 0).unwrap();

        router.unregister(&alice());
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }
}
