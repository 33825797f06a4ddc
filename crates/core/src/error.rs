//! Shared error type

use thiserror::Error;

/// Top-level error for session-facing APIs.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("session error: {0}")]
    Session(String),

    /// Work was cancelled, not failed. Callers treat this as clean unwind.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
