//! Speak pipeline: chunks to outbound frames
//!
//! Consumes a turn's ordered SpeakChunks, synthesizes each, resamples to
//! the publish rate, and packetizes onto the egress queue. Strictly one
//! chunk at a time, so prosody order survives. Cancellation is observed at
//! every await.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use confab_transport::{downmix_to_mono, AudioEgress, FramePacker, OutboundFrame, SincResampler};

use super::TtsClient;
use crate::generator::SpeakChunk;
use crate::{await_cancelled, PipelineError};

/// Speak pipeline configuration
#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    /// Rate of frames handed to the media transport
    pub publish_sample_rate_hz: u32,
    /// Outbound frame duration
    pub frame_ms: u64,
    /// Deadline for the first synthesized byte, per chunk
    pub first_byte_timeout: Duration,
    /// Egress backpressure past this abandons the chunk
    pub stall_timeout: Duration,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            publish_sample_rate_hz: 48_000,
            frame_ms: 20,
            first_byte_timeout: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(2),
        }
    }
}

/// What one speak run did, for telemetry.
#[derive(Debug, Default)]
pub struct SpeakStats {
    /// First chunk's request-to-first-byte
    pub ttfb_ms: Option<u64>,
    /// When the first outbound frame was enqueued
    pub first_audio_at: Option<Instant>,
    pub chunks_spoken: u32,
    /// Chunks dropped to stalls or synthesis failures
    pub chunks_abandoned: u32,
}

/// How a speak run ended.
#[derive(Debug)]
pub enum SpeakOutcome {
    /// All chunks spoken and the queue drained
    Completed(SpeakStats),
    /// CancelTurn observed
    Cancelled(SpeakStats),
}

/// Drives synthesis and egress for one turn at a time.
pub struct Speaker {
    tts: Arc<dyn TtsClient>,
    egress: Arc<AudioEgress>,
    config: SpeakerConfig,
}

impl Speaker {
    pub fn new(tts: Arc<dyn TtsClient>, egress: Arc<AudioEgress>, config: SpeakerConfig) -> Self {
        Self { tts, egress, config }
    }

    /// Speak a turn's chunk stream to the room.
    pub async fn speak_turn(
        &self,
        turn_id: u64,
        mut chunks: mpsc::Receiver<SpeakChunk>,
        mut cancel: watch::Receiver<bool>,
    ) -> SpeakOutcome {
        let mut stats = SpeakStats::default();

        loop {
            let chunk = tokio::select! {
                _ = await_cancelled(&mut cancel) => return SpeakOutcome::Cancelled(stats),
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let is_final = chunk.is_final;
            if !chunk.text.trim().is_empty() {
                match self
                    .speak_chunk(turn_id, &chunk, &mut cancel, &mut stats)
                    .await
                {
                    Ok(()) => stats.chunks_spoken += 1,
                    Err(PipelineError::Cancelled) => return SpeakOutcome::Cancelled(stats),
                    Err(PipelineError::EgressStalled) => {
                        stats.chunks_abandoned += 1;
                        tracing::warn!(turn_id, chunk = chunk.index, "egress stalled, abandoning chunk");
                    }
                    Err(e) => {
                        stats.chunks_abandoned += 1;
                        tracing::warn!(turn_id, chunk = chunk.index, error = %e, "chunk synthesis failed, skipping");
                    }
                }
            }
            if is_final {
                break;
            }
        }

        // Everything is enqueued; wait for the room to drain it, bounded by
        // the stall deadline in case the transport has wedged.
        tokio::select! {
            _ = await_cancelled(&mut cancel) => SpeakOutcome::Cancelled(stats),
            drained = tokio::time::timeout(self.config.stall_timeout, self.egress.wait_idle()) => {
                if drained.is_err() {
                    tracing::warn!(turn_id, "egress still draining at turn end");
                }
                SpeakOutcome::Completed(stats)
            }
        }
    }

    async fn speak_chunk(
        &self,
        turn_id: u64,
        chunk: &SpeakChunk,
        cancel: &mut watch::Receiver<bool>,
        stats: &mut SpeakStats,
    ) -> Result<(), PipelineError> {
        let request_at = Instant::now();
        let mut stream = tokio::select! {
            _ = await_cancelled(cancel) => return Err(PipelineError::Cancelled),
            result = self.tts.synthesize(&chunk.text) => result?,
        };

        let mut resampler =
            SincResampler::new(stream.sample_rate_hz, self.config.publish_sample_rate_hz);
        let mut packer = FramePacker::new(self.config.publish_sample_rate_hz, self.config.frame_ms);
        let first_byte_deadline = request_at + self.config.first_byte_timeout;
        let mut got_first_byte = false;

        loop {
            let pcm = tokio::select! {
                _ = await_cancelled(cancel) => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep_until(first_byte_deadline), if !got_first_byte => {
                    return Err(PipelineError::Tts(
                        "no audio within the first-byte deadline".to_string(),
                    ));
                }
                pcm = stream.pcm.recv() => pcm,
            };

            match pcm {
                Some(Ok(samples)) => {
                    if !got_first_byte {
                        got_first_byte = true;
                        if stats.ttfb_ms.is_none() {
                            stats.ttfb_ms = Some(request_at.elapsed().as_millis() as u64);
                        }
                    }
                    let mono = downmix_to_mono(&samples, stream.channels);
                    for frame in packer.push(&resampler.process(&mono)) {
                        self.enqueue(turn_id, chunk.index, frame, stats).await?;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        // Drain the resampler tail and the final partial frame.
        let mut frames = packer.push(&resampler.flush());
        frames.extend(packer.flush());
        for frame in frames {
            self.enqueue(turn_id, chunk.index, frame, stats).await?;
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        turn_id: u64,
        chunk_index: u32,
        pcm: Vec<i16>,
        stats: &mut SpeakStats,
    ) -> Result<(), PipelineError> {
        let push = self.egress.push(OutboundFrame {
            turn_id,
            chunk_index,
            pcm,
        });
        match tokio::time::timeout(self.config.stall_timeout, push).await {
            Ok(()) => {
                if stats.first_audio_at.is_none() {
                    stats.first_audio_at = Some(Instant::now());
                }
                Ok(())
            }
            Err(_) => Err(PipelineError::EgressStalled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::SynthesisStream;
    use async_trait::async_trait;
    use confab_transport::EgressConfig;

    /// Synthesizer double: emits one second of flat PCM per request at
    /// 48 kHz so no resampling happens in tests.
    struct FakeTts {
        samples_per_request: usize,
    }

    #[async_trait]
    impl TtsClient for FakeTts {
        async fn synthesize(&self, _text: &str) -> Result<SynthesisStream, PipelineError> {
            let (tx, rx) = mpsc::channel(4);
            let total = self.samples_per_request;
            tokio::spawn(async move {
                let _ = tx.send(Ok(vec![1000i16; total])).await;
            });
            Ok(SynthesisStream {
                sample_rate_hz: 48_000,
                channels: 1,
                pcm: rx,
            })
        }
    }

    fn speaker_with_egress(capacity_ms: u64) -> (Speaker, Arc<AudioEgress>) {
        let egress = Arc::new(AudioEgress::new(EgressConfig {
            capacity_ms,
            frame_ms: 20,
            fade_ms: 20,
        }));
        let speaker = Speaker::new(
            Arc::new(FakeTts {
                samples_per_request: 4800, // 100ms at 48kHz
            }),
            Arc::clone(&egress),
            SpeakerConfig::default(),
        );
        (speaker, egress)
    }

    fn chunk(index: u32, is_final: bool) -> SpeakChunk {
        SpeakChunk {
            index,
            text: "some words".to_string(),
            is_final,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_drain_in_order() {
        let (speaker, egress) = speaker_with_egress(2000);
        egress.begin_turn(1);

        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(0, false)).await.unwrap();
        tx.send(chunk(1, true)).await.unwrap();
        drop(tx);

        let (_, cancel_rx) = watch::channel(false);
        let drainer = {
            let egress = Arc::clone(&egress);
            tokio::spawn(async move {
                let mut indices = Vec::new();
                while let Some(frame) = egress.next_frame().await {
                    indices.push(frame.chunk_index);
                }
                indices
            })
        };

        let outcome = speaker.speak_turn(1, rx, cancel_rx).await;
        assert!(matches!(outcome, SpeakOutcome::Completed(_)));
        egress.close();

        let indices = drainer.await.unwrap();
        assert!(!indices.is_empty());
        // Chunk order is non-decreasing: chunk 0 fully drains before chunk 1
        assert!(indices.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_speaking() {
        let (speaker, egress) = speaker_with_egress(2000);
        egress.begin_turn(3);

        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(0, false)).await.unwrap();
        // Keep the channel open: more chunks "coming"

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { speaker.speak_turn(3, rx, cancel_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, SpeakOutcome::Cancelled(_)));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_abandons_chunk_and_continues() {
        // Tiny queue, no consumer: the first chunk stalls out
        let (speaker, egress) = speaker_with_egress(40);
        egress.begin_turn(9);

        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(0, true)).await.unwrap();
        drop(tx);

        let (_, cancel_rx) = watch::channel(false);
        let outcome = speaker.speak_turn(9, rx, cancel_rx).await;

        match outcome {
            SpeakOutcome::Completed(stats) => {
                assert_eq!(stats.chunks_abandoned, 1);
                assert_eq!(stats.chunks_spoken, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttfb_recorded() {
        let (speaker, egress) = speaker_with_egress(8000);
        egress.begin_turn(1);

        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(0, true)).await.unwrap();
        drop(tx);

        let (_, cancel_rx) = watch::channel(false);
        match speaker.speak_turn(1, rx, cancel_rx).await {
            SpeakOutcome::Completed(stats) => {
                assert!(stats.ttfb_ms.is_some());
                assert!(stats.first_audio_at.is_some());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
