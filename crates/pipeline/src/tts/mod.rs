//! Streaming text-to-speech and the speak pipeline
//!
//! One streaming synthesis request per chunk, resampled to the publish rate
//! and packetized onto the outbound queue. Chunk N drains fully before any
//! frame of chunk N+1 is enqueued, and cancellation stops synthesis
//! mid-stream.

mod http;
mod speaker;

pub use http::PiperClient;
pub use speaker::{SpeakOutcome, SpeakStats, Speaker, SpeakerConfig};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::PipelineError;

/// Raw PCM flowing back from one synthesis request.
///
/// Dropping the receiver aborts the request.
pub struct SynthesisStream {
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub pcm: mpsc::Receiver<Result<Vec<i16>, PipelineError>>,
}

/// Streaming synthesizer, injectable for tests.
#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Start one streaming synthesis request.
    async fn synthesize(&self, text: &str) -> Result<SynthesisStream, PipelineError>;

    /// Probe the synthesizer, used at session startup.
    async fn health_check(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}
