//! Per-session voice pipeline
//!
//! This crate provides the conversational core:
//! - Voice Activity Detection over fixed windows
//! - Streaming STT transport (WebSocket) with reconnect and dedup
//! - The turn controller state machine (the single arbiter of who speaks)
//! - The response generator (LLM token stream to speakable chunks)
//! - Streaming TTS and the speak pipeline down to audio egress
//! - The session orchestrator wiring one room's worth of the above

pub mod generator;
pub mod orchestrator;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;

pub use generator::{GeneratorConfig, GeneratorOutcome, SpeakChunk};
pub use orchestrator::{EngineClients, SessionPipeline, SessionPipelineConfig};
pub use stt::{
    SttClient, SttEvent, SttSegment, SttSession, SttSessionConfig, SttSink, SttSource,
    WhisperLiveClient,
};
pub use tts::{PiperClient, Speaker, SpeakerConfig, SynthesisStream, TtsClient};
pub use turn::{TurnAction, TurnController, TurnControllerConfig, TurnEvent, TurnState};
pub use vad::{EnergyScorer, VadConfig, VadEvent, VadScorer, VoiceActivityDetector};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("VAD error: {0}")]
    Vad(String),

    #[error("STT error: {0}")]
    Stt(String),

    /// STT retries exhausted during an active utterance
    #[error("STT unavailable")]
    SttUnavailable,

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("no LLM token within the first-token deadline")]
    LlmTimeout,

    #[error("TTS error: {0}")]
    Tts(String),

    /// Outbound media stalled past the stall deadline; chunk abandoned
    #[error("egress stalled")]
    EgressStalled,

    #[error("channel closed")]
    ChannelClosed,

    #[error("timeout")]
    Timeout,

    /// Clean unwind after CancelTurn, distinct from failure
    #[error("cancelled")]
    Cancelled,
}

/// Resolves once the cancel flag is raised; pends forever otherwise, even
/// if the sender is gone without cancelling. Callers always race this
/// against real work.
pub(crate) async fn await_cancelled(cancel: &mut tokio::sync::watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl From<confab_llm::LlmError> for PipelineError {
    fn from(err: confab_llm::LlmError) -> Self {
        match err {
            confab_llm::LlmError::Timeout => PipelineError::LlmTimeout,
            confab_llm::LlmError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Llm(other.to_string()),
        }
    }
}

impl From<PipelineError> for confab_core::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Cancelled => confab_core::Error::Cancelled,
            other => confab_core::Error::Pipeline(other.to_string()),
        }
    }
}
