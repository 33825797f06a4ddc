//! Core types for the confab voice agent
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame types
//! - Utterance and transcript types
//! - Dialogue context (rolling conversation window)
//! - Telemetry payloads published on room data channels
//! - Error types

pub mod audio;
pub mod dialogue;
pub mod error;
pub mod telemetry;
pub mod transcript;

pub use audio::{AudioFrame, ParticipantId, MAX_FRAME_MS, PIPELINE_SAMPLE_RATE_HZ};
pub use dialogue::{DialogueContext, DialogueTurn, Role, SharedDialogue};
pub use error::{Error, Result};
pub use telemetry::{
    AgentStatusMessage, Speaker, TelemetryEvent, TranscriptMessage, TurnLatency,
    TOPIC_AGENT_STATUS, TOPIC_TRANSCRIPTS,
};
pub use transcript::Utterance;
