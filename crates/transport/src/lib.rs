//! Media transport interface and audio plumbing
//!
//! This crate owns the boundary to the media server:
//! - [`MediaTransport`] trait consumed by the session (room callbacks in,
//!   published audio and data out)
//! - Audio ingress demultiplexing with per-participant bounded queues
//! - Sample-rate conversion (linear on ingress, windowed-sinc on egress)
//! - The bounded outbound audio queue with turn-scoped cancellation

pub mod egress;
pub mod ingress;
pub mod resample;
pub mod traits;

pub use egress::{AudioEgress, EgressConfig, OutboundFrame};
pub use ingress::{FrameQueue, IngressConfig, IngressRouter};
pub use resample::{downmix_to_mono, FramePacker, LinearResampler, SincResampler};
pub use traits::{MediaEvent, MediaTransport};

use confab_core::ParticipantId;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("no registered participant with identity {0}")]
    ParticipantUnknown(ParticipantId),

    #[error("ingress queue closed")]
    QueueClosed,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("transport error: {0}")]
    Internal(String),
}

impl From<TransportError> for confab_core::Error {
    fn from(err: TransportError) -> Self {
        confab_core::Error::Transport(err.to_string())
    }
}
