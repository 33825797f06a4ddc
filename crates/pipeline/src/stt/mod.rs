//! Streaming speech-to-text transport
//!
//! One recognition stream per active participant. The connection opens on
//! the first SpeechStart, stays warm between utterances, and is torn down
//! after 30 s idle. Loss during an active utterance is retried with
//! exponential backoff; exhaustion surfaces as `Unavailable` and the
//! utterance commits empty.

mod session;
mod whisperlive;

pub use session::{SttCommand, SttSession, SttSessionConfig};
pub use whisperlive::WhisperLiveClient;

use async_trait::async_trait;

use confab_core::ParticipantId;

use crate::PipelineError;

/// One recognized segment from the recognizer.
#[derive(Debug, Clone)]
pub struct SttSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
    /// Finals will not be revised; interims may be superseded
    pub completed: bool,
}

/// Recognition event, tagged with the utterance the transport attributes it
/// to.
#[derive(Debug, Clone)]
pub enum SttEvent {
    Interim {
        participant: ParticipantId,
        utterance_id: u64,
        text: String,
    },
    Final {
        participant: ParticipantId,
        utterance_id: u64,
        text: String,
    },
    /// Retries exhausted during this utterance
    Unavailable {
        participant: ParticipantId,
        utterance_id: u64,
    },
}

/// Write half of a recognition stream.
#[async_trait]
pub trait SttSink: Send {
    /// Forward little-endian i16 PCM at 16 kHz mono.
    async fn send_audio(&mut self, pcm_le: Vec<u8>) -> Result<(), PipelineError>;

    /// Ask the recognizer to flush pending segments.
    async fn flush(&mut self) -> Result<(), PipelineError>;
}

/// Read half of a recognition stream.
#[async_trait]
pub trait SttSource: Send {
    /// Next batch of segments; `Ok(None)` when the server closes.
    async fn next_segments(&mut self) -> Result<Option<Vec<SttSegment>>, PipelineError>;
}

/// Recognition stream factory, injectable for tests.
#[async_trait]
pub trait SttClient: Send + Sync {
    async fn connect(
        &self,
        participant: &ParticipantId,
    ) -> Result<(Box<dyn SttSink>, Box<dyn SttSource>), PipelineError>;
}
