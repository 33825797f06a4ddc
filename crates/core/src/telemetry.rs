//! Telemetry payloads published on room data channels
//!
//! Two topics: `transcripts` carries user/assistant transcript messages for
//! UI consumption, `agent_status` carries the turn state machine and per-turn
//! latency breakdowns. No persistence contract; delivery is fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::ParticipantId;

/// Data-channel topic for transcript messages.
pub const TOPIC_TRANSCRIPTS: &str = "transcripts";

/// Data-channel topic for agent status messages.
pub const TOPIC_AGENT_STATUS: &str = "agent_status";

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// Transcript message on the `transcripts` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub speaker: Speaker,
    #[serde(rename = "participantIdentity")]
    pub participant_identity: String,
    #[serde(rename = "participantSid")]
    pub participant_sid: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interim: Option<bool>,
}

impl TranscriptMessage {
    pub fn user(participant: &ParticipantId, sid: &str, text: impl Into<String>, interim: bool) -> Self {
        Self {
            kind: "transcript".to_string(),
            speaker: Speaker::User,
            participant_identity: participant.as_str().to_string(),
            participant_sid: sid.to_string(),
            text: text.into(),
            timestamp: Utc::now(),
            interim: interim.then_some(true),
        }
    }

    pub fn assistant(identity: &str, sid: &str, text: impl Into<String>) -> Self {
        Self {
            kind: "transcript".to_string(),
            speaker: Speaker::Assistant,
            participant_identity: identity.to_string(),
            participant_sid: sid.to_string(),
            text: text.into(),
            timestamp: Utc::now(),
            interim: None,
        }
    }
}

/// Per-turn latency breakdown, all in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnLatency {
    /// SpeechEnd to last final transcript
    pub stt_ms: u64,
    /// Commit to first LLM token
    pub llm_ttft_ms: u64,
    /// Commit to LLM done
    pub llm_total_ms: u64,
    /// First chunk handed to TTS to first synthesized byte
    pub tts_ttfb_ms: u64,
    /// SpeechEnd to first outbound audio frame
    pub e2e_ms: u64,
}

/// Status message on the `agent_status` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusMessage {
    /// Turn controller state, lowercase
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latencies: Option<TurnLatency>,
}

impl AgentStatusMessage {
    pub fn state_only(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            turn_id: None,
            latencies: None,
        }
    }
}

/// Internal telemetry event fanned out within a session.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Transcript(TranscriptMessage),
    Status(AgentStatusMessage),
}

impl TelemetryEvent {
    /// Topic the event is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            TelemetryEvent::Transcript(_) => TOPIC_TRANSCRIPTS,
            TelemetryEvent::Status(_) => TOPIC_AGENT_STATUS,
        }
    }

    /// Wire payload for `publish_data`.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            TelemetryEvent::Transcript(msg) => serde_json::to_vec(msg),
            TelemetryEvent::Status(msg) => serde_json::to_vec(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_wire_shape() {
        let msg = TranscriptMessage::user(&ParticipantId::from("alice"), "PA_x1", "Hello", true);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["speaker"], "user");
        assert_eq!(json["participantIdentity"], "alice");
        assert_eq!(json["interim"], true);
    }

    #[test]
    fn test_final_transcript_omits_interim() {
        let msg = TranscriptMessage::user(&ParticipantId::from("alice"), "PA_x1", "Hello", false);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("interim"));
    }

    #[test]
    fn test_status_wire_shape() {
        let msg = AgentStatusMessage {
            state: "speaking".to_string(),
            turn_id: Some(3),
            latencies: Some(TurnLatency {
                stt_ms: 120,
                llm_ttft_ms: 340,
                llm_total_ms: 900,
                tts_ttfb_ms: 180,
                e2e_ms: 1400,
            }),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["state"], "speaking");
        assert_eq!(json["latencies"]["llm_ttft_ms"], 340);
    }
}
