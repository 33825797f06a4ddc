//! Media transport interface
//!
//! Abstract boundary to the media server. The real implementation wraps the
//! room SDK; tests inject doubles.

use async_trait::async_trait;
use tokio::sync::mpsc;

use confab_core::ParticipantId;

use crate::TransportError;

/// Room event delivered by the media transport.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A participant joined the room
    ParticipantJoined {
        identity: ParticipantId,
        /// Server-assigned participant sid, opaque to the core
        sid: String,
        display_name: Option<String>,
    },
    /// A participant left the room
    ParticipantLeft { identity: ParticipantId },
    /// Decoded audio from a participant's track
    AudioFrame {
        identity: ParticipantId,
        pcm: Vec<i16>,
        sample_rate_hz: u32,
        channels: u8,
        capture_ts_ms: u64,
    },
    /// The room connection dropped
    Disconnected { reason: String },
}

/// Media transport consumed by a session.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Register the channel room events are delivered on. Events must arrive
    /// in capture order per participant.
    fn set_event_sink(&self, tx: mpsc::Sender<MediaEvent>);

    /// Publish one frame of mono PCM on the agent's outbound track.
    async fn publish_audio_frame(
        &self,
        pcm: &[i16],
        sample_rate_hz: u32,
        channels: u8,
    ) -> Result<(), TransportError>;

    /// Publish a payload on a named data-channel topic.
    async fn publish_data(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
}
