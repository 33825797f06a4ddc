//! Outbound audio queue
//!
//! Bounded queue of publish-rate frames between the speak pipeline and the
//! media transport. Frames are tagged with the turn that produced them;
//! cancelling a turn discards everything it still owns, so no orphan audio
//! of a cancelled turn ever reaches the room.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Egress configuration
#[derive(Debug, Clone)]
pub struct EgressConfig {
    /// Queue capacity, in milliseconds of audio
    pub capacity_ms: u64,
    /// Duration of one outbound frame
    pub frame_ms: u64,
    /// Fade length applied to the cut point on cancel, in milliseconds
    pub fade_ms: u64,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            capacity_ms: 500,
            frame_ms: 20,
            fade_ms: 20,
        }
    }
}

/// One publish-rate frame, owned by a turn.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub turn_id: u64,
    pub chunk_index: u32,
    pub pcm: Vec<i16>,
}

struct EgressState {
    queue: VecDeque<OutboundFrame>,
    /// Turn currently allowed to enqueue; `None` means nothing is speaking
    active_turn: Option<u64>,
    closed: bool,
}

/// Bounded outbound audio queue with turn-scoped cancellation.
pub struct AudioEgress {
    state: Mutex<EgressState>,
    capacity_frames: usize,
    fade_ms: u64,
    frame_ms: u64,
    space: Notify,
    available: Notify,
}

impl AudioEgress {
    pub fn new(config: EgressConfig) -> Self {
        Self {
            state: Mutex::new(EgressState {
                queue: VecDeque::new(),
                active_turn: None,
                closed: false,
            }),
            capacity_frames: (config.capacity_ms / config.frame_ms.max(1)).max(1) as usize,
            fade_ms: config.fade_ms,
            frame_ms: config.frame_ms,
            space: Notify::new(),
            available: Notify::new(),
        }
    }

    /// Mark a turn as the one allowed to produce audio.
    pub fn begin_turn(&self, turn_id: u64) {
        let mut state = self.state.lock();
        state.active_turn = Some(turn_id);
    }

    /// Enqueue a frame, waiting for space under backpressure.
    ///
    /// Frames whose turn is no longer active are silently discarded; the
    /// speak pipeline may still be unwinding after a cancel. The caller
    /// wraps this in a timeout to implement the stall rule.
    pub async fn push(&self, frame: OutboundFrame) {
        loop {
            let space = self.space.notified();
            {
                let mut state = self.state.lock();
                if state.closed || state.active_turn != Some(frame.turn_id) {
                    return;
                }
                if state.queue.len() < self.capacity_frames {
                    state.queue.push_back(frame);
                    self.available.notify_one();
                    return;
                }
            }
            space.await;
        }
    }

    /// Dequeue the next frame for publication. Returns `None` once closed
    /// and drained.
    pub async fn next_frame(&self) -> Option<OutboundFrame> {
        loop {
            let available = self.available.notified();
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.queue.pop_front() {
                    self.space.notify_one();
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            available.await;
        }
    }

    /// Cancel a turn: discard its queued frames, keeping only a short faded
    /// tail of the frame that would have played next, to avoid a click.
    ///
    /// After this returns, no frame of `turn_id` will be dequeued again.
    pub fn cancel_turn(&self, turn_id: u64) {
        let mut state = self.state.lock();
        if state.active_turn == Some(turn_id) {
            state.active_turn = None;
        }

        let fade_tail = state.queue.front().filter(|f| f.turn_id == turn_id).map(|next| {
            let mut pcm = next.pcm.clone();
            let fade_samples =
                (pcm.len() as u64 * self.fade_ms / self.frame_ms.max(1)).min(pcm.len() as u64)
                    as usize;
            for (i, sample) in pcm.iter_mut().take(fade_samples).enumerate() {
                let gain = 1.0 - ((i + 1) as f32 / fade_samples.max(1) as f32);
                *sample = (*sample as f32 * gain) as i16;
            }
            // Everything past the fade is silence
            for sample in pcm.iter_mut().skip(fade_samples) {
                *sample = 0;
            }
            OutboundFrame {
                turn_id: next.turn_id,
                chunk_index: next.chunk_index,
                pcm,
            }
        });

        state.queue.retain(|f| f.turn_id != turn_id);
        if let Some(tail) = fade_tail {
            state.queue.push_front(tail);
            self.available.notify_one();
        }
        self.space.notify_waiters();
    }

    /// Resolves once the queue is empty (everything handed to the media
    /// transport) or closed.
    pub async fn wait_idle(&self) {
        loop {
            let space = self.space.notified();
            {
                let state = self.state.lock();
                if state.queue.is_empty() || state.closed {
                    return;
                }
            }
            space.await;
        }
    }

    /// Close the queue; pending frames remain dequeuable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn queued_frames(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(turn_id: u64, chunk_index: u32) -> OutboundFrame {
        OutboundFrame {
            turn_id,
            chunk_index,
            pcm: vec![1000i16; 960],
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let egress = AudioEgress::new(EgressConfig::default());
        egress.begin_turn(1);
        egress.push(frame(1, 0)).await;
        egress.push(frame(1, 1)).await;

        assert_eq!(egress.next_frame().await.unwrap().chunk_index, 0);
        assert_eq!(egress.next_frame().await.unwrap().chunk_index, 1);
    }

    #[tokio::test]
    async fn test_cancel_discards_queued_frames() {
        let egress = AudioEgress::new(EgressConfig::default());
        egress.begin_turn(7);
        for i in 0..5 {
            egress.push(frame(7, i)).await;
        }

        egress.cancel_turn(7);

        // Only the faded tail frame survives
        assert_eq!(egress.queued_frames(), 1);
        let tail = egress.next_frame().await.unwrap();
        assert_eq!(tail.turn_id, 7);
        // Fade ends in silence
        assert_eq!(*tail.pcm.last().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_push_after_cancel_is_discarded() {
        let egress = AudioEgress::new(EgressConfig::default());
        egress.begin_turn(1);
        egress.cancel_turn(1);

        egress.push(frame(1, 0)).await;
        assert_eq!(egress.queued_frames(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_blocks_until_space() {
        let egress = Arc::new(AudioEgress::new(EgressConfig {
            capacity_ms: 40,
            frame_ms: 20,
            fade_ms: 20,
        }));
        egress.begin_turn(1);
        egress.push(frame(1, 0)).await;
        egress.push(frame(1, 1)).await;

        // Queue full: a third push must block
        let pusher = {
            let egress = Arc::clone(&egress);
            tokio::spawn(async move { egress.push(frame(1, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pusher.is_finished());

        // Draining one frame releases the pusher
        egress.next_frame().await.unwrap();
        pusher.await.unwrap();
        assert_eq!(egress.queued_frames(), 2);
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let egress = AudioEgress::new(EgressConfig::default());
        egress.begin_turn(1);
        egress.push(frame(1, 0)).await;
        egress.close();

        assert!(egress.next_frame().await.is_some());
        assert!(egress.next_frame().await.is_none());
    }
}
