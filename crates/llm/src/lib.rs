//! Streaming language-model client
//!
//! Talks to an Ollama-style chat endpoint: `POST /api/chat` with
//! `stream: true`, newline-delimited JSON deltas back, `{done: true}` as
//! terminator. The generator in the pipeline crate owns chunking and
//! timeout policy; this crate owns the wire.

mod client;
mod prompt;

pub use client::{ChatMessage, LlmClient, OllamaClient, TokenStream};
pub use prompt::build_messages;

use thiserror::Error;

/// LLM errors
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("no token within the first-token deadline")]
    Timeout,

    #[error("chat endpoint error: {0}")]
    Http(String),

    #[error("malformed stream: {0}")]
    Malformed(String),

    /// The request was cancelled by the caller, not failed.
    #[error("cancelled")]
    Cancelled,
}

impl From<LlmError> for confab_core::Error {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => confab_core::Error::Cancelled,
            other => confab_core::Error::Pipeline(other.to_string()),
        }
    }
}
