//! Audio frame types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sample rate the VAD and STT stages operate at.
pub const PIPELINE_SAMPLE_RATE_HZ: u32 = 16_000;

/// Upper bound on a single frame's duration. Ingress re-cuts anything longer.
pub const MAX_FRAME_MS: u64 = 40;

/// Stable participant identity within a room.
///
/// Identities are assigned by the media server and are unique within a
/// session for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One frame of decoded mono PCM audio attributed to a participant.
///
/// Frames are produced by ingress, consumed once by VAD + STT, then dropped.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Participant the audio came from
    pub participant: ParticipantId,
    /// Signed 16-bit mono samples
    pub pcm: Vec<i16>,
    /// Sample rate of `pcm`
    pub sample_rate_hz: u32,
    /// Monotonic capture timestamp, milliseconds from session start
    pub capture_ts_ms: u64,
}

impl AudioFrame {
    pub fn new(
        participant: ParticipantId,
        pcm: Vec<i16>,
        sample_rate_hz: u32,
        capture_ts_ms: u64,
    ) -> Self {
        Self {
            participant,
            pcm,
            sample_rate_hz,
            capture_ts_ms,
        }
    }

    /// Frame duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate_hz == 0 {
            return 0;
        }
        (self.pcm.len() as u64 * 1000) / self.sample_rate_hz as u64
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.pcm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    /// Samples as little-endian bytes, the layout STT expects on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pcm.len() * 2);
        for sample in &self.pcm {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(
            ParticipantId::from("alice"),
            vec![0i16; 320],
            PIPELINE_SAMPLE_RATE_HZ,
            0,
        );
        assert_eq!(frame.duration_ms(), 20);
    }

    #[test]
    fn test_le_bytes_layout() {
        let frame = AudioFrame::new(ParticipantId::from("alice"), vec![1i16, -2], 16_000, 0);
        assert_eq!(frame.to_le_bytes(), vec![1, 0, 0xfe, 0xff]);
    }
}
