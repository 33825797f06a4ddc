//! Response generation
//!
//! Streams tokens from the LLM for a committed utterance and re-cuts them
//! into synthesis-sized chunks. The chunk policy is the main latency lever:
//! the first chunk goes out at the first sentence boundary, 80 characters,
//! or 400 ms after the first token, whichever comes first; later chunks cut
//! at sentence boundaries or 120 characters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use confab_llm::{ChatMessage, LlmClient};

use crate::await_cancelled as cancelled;
use crate::PipelineError;

/// One speakable chunk of assistant text, ordered within a turn.
#[derive(Debug, Clone)]
pub struct SpeakChunk {
    pub index: u32,
    pub text: String,
    pub is_final: bool,
}

/// Generator configuration
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// First chunk emits at this many characters
    pub first_chunk_max_chars: usize,
    /// Later chunks emit at this many characters
    pub next_chunk_max_chars: usize,
    /// First chunk emits this long after the first token regardless
    pub first_chunk_deadline: Duration,
    /// No token at all within this is a failure
    pub first_token_timeout: Duration,
    /// Whole-generation ceiling
    pub total_timeout: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            first_chunk_max_chars: 80,
            next_chunk_max_chars: 120,
            first_chunk_deadline: Duration::from_millis(400),
            first_token_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(20),
        }
    }
}

impl GeneratorConfig {
    pub fn from_settings(timeouts: &confab_config::TimeoutSettings) -> Self {
        Self {
            first_token_timeout: Duration::from_millis(timeouts.llm_first_token_ms),
            total_timeout: Duration::from_millis(timeouts.llm_total_ms),
            ..Self::default()
        }
    }
}

/// What a generation run produced.
#[derive(Debug)]
pub struct GeneratorOutcome {
    /// Everything the model said, emitted or not
    pub text: String,
    /// Cut short by CancelTurn
    pub truncated: bool,
    /// Failure, if the run did not complete cleanly
    pub error: Option<PipelineError>,
    /// Commit to first token
    pub ttft_ms: Option<u64>,
    /// Commit to end of run
    pub total_ms: u64,
}

impl GeneratorOutcome {
    fn finished(text: String, ttft_ms: Option<u64>, started: Instant) -> Self {
        Self {
            text,
            truncated: false,
            error: None,
            ttft_ms,
            total_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn cancelled(text: String, ttft_ms: Option<u64>, started: Instant) -> Self {
        Self {
            text,
            truncated: true,
            error: None,
            ttft_ms,
            total_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failed(
        text: String,
        error: PipelineError,
        ttft_ms: Option<u64>,
        started: Instant,
    ) -> Self {
        Self {
            text,
            truncated: false,
            error: Some(error),
            ttft_ms,
            total_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Run one generation: stream tokens, emit ordered chunks, observe
/// cancellation at every suspension point.
pub async fn run_generator(
    llm: Arc<dyn LlmClient>,
    messages: Vec<ChatMessage>,
    config: GeneratorConfig,
    chunks: mpsc::Sender<SpeakChunk>,
    mut cancel: watch::Receiver<bool>,
) -> GeneratorOutcome {
    let started = Instant::now();
    let first_token_deadline = started + config.first_token_timeout;
    let total_deadline = started + config.total_timeout;

    let mut stream = tokio::select! {
        result = llm.chat_stream(messages) => match result {
            Ok(stream) => stream,
            Err(e) => return GeneratorOutcome::failed(String::new(), e.into(), None, started),
        },
        _ = cancelled(&mut cancel) => {
            return GeneratorOutcome::cancelled(String::new(), None, started);
        }
    };

    let mut full = String::new();
    let mut pending = String::new();
    let mut index = 0u32;
    let mut ttft_ms: Option<u64> = None;
    let mut first_chunk_deadline: Option<Instant> = None;

    loop {
        let timer = match (ttft_ms, first_chunk_deadline) {
            (None, _) => first_token_deadline,
            (Some(_), Some(deadline)) if index == 0 => deadline.min(total_deadline),
            _ => total_deadline,
        };

        tokio::select! {
            _ = cancelled(&mut cancel) => {
                return GeneratorOutcome::cancelled(full, ttft_ms, started);
            }

            token = stream.recv() => match token {
                Some(Ok(token)) => {
                    if ttft_ms.is_none() {
                        ttft_ms = Some(started.elapsed().as_millis() as u64);
                        first_chunk_deadline = Some(Instant::now() + config.first_chunk_deadline);
                    }
                    full.push_str(&token);
                    pending.push_str(&token);

                    let limit = if index == 0 {
                        config.first_chunk_max_chars
                    } else {
                        config.next_chunk_max_chars
                    };
                    while let Some(text) = take_ready_chunk(&mut pending, limit) {
                        if emit(&chunks, &mut index, text, false).await.is_err() {
                            return GeneratorOutcome::cancelled(full, ttft_ms, started);
                        }
                    }
                }
                Some(Err(e)) => {
                    return GeneratorOutcome::failed(full, e.into(), ttft_ms, started);
                }
                None => {
                    // Model signalled done; flush the tail as the final chunk.
                    let tail = std::mem::take(&mut pending);
                    let tail = tail.trim().to_string();
                    let _ = emit(&chunks, &mut index, tail, true).await;
                    return GeneratorOutcome::finished(full, ttft_ms, started);
                }
            },

            _ = tokio::time::sleep_until(timer) => {
                if ttft_ms.is_none() {
                    return GeneratorOutcome::failed(full, PipelineError::LlmTimeout, None, started);
                }
                if Instant::now() >= total_deadline {
                    let tail = std::mem::take(&mut pending);
                    let _ = emit(&chunks, &mut index, tail.trim().to_string(), true).await;
                    return GeneratorOutcome::failed(full, PipelineError::Timeout, ttft_ms, started);
                }
                // First-chunk deadline: ship whatever has accumulated.
                if index == 0 && !pending.trim().is_empty() {
                    let text = std::mem::take(&mut pending).trim().to_string();
                    if emit(&chunks, &mut index, text, false).await.is_err() {
                        return GeneratorOutcome::cancelled(full, ttft_ms, started);
                    }
                }
                first_chunk_deadline = None;
            }
        }
    }
}

async fn emit(
    chunks: &mpsc::Sender<SpeakChunk>,
    index: &mut u32,
    text: String,
    is_final: bool,
) -> Result<(), PipelineError> {
    if text.is_empty() && !is_final {
        return Ok(());
    }
    let chunk = SpeakChunk {
        index: *index,
        text,
        is_final,
    };
    *index += 1;
    chunks
        .send(chunk)
        .await
        .map_err(|_| PipelineError::ChannelClosed)
}

/// Cut the next emittable chunk out of `pending`, if one is ready: a
/// sentence boundary, or the character limit (split at the last word break).
fn take_ready_chunk(pending: &mut String, limit: usize) -> Option<String> {
    if let Some(end) = sentence_boundary(pending) {
        let tail = pending.split_off(end);
        let chunk = std::mem::replace(pending, tail);
        let chunk = chunk.trim().to_string();
        if !chunk.is_empty() {
            return Some(chunk);
        }
        return None;
    }

    if pending.chars().count() >= limit {
        // Word break closest to the limit without passing it
        let mut cut = None;
        for (chars_seen, (i, c)) in pending.char_indices().enumerate() {
            if chars_seen > limit {
                break;
            }
            if chars_seen > 0 && c.is_whitespace() {
                cut = Some(i);
            }
        }
        let chunk = match cut {
            Some(i) => {
                let tail = pending.split_off(i);
                std::mem::replace(pending, tail.trim_start().to_string())
            }
            None => std::mem::take(pending),
        };
        let chunk = chunk.trim().to_string();
        if !chunk.is_empty() {
            return Some(chunk);
        }
    }

    None
}

/// Byte offset just past the first sentence-final punctuation mark that is
/// followed by whitespace or ends the buffer.
fn sentence_boundary(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            let next = bytes.get(i + 1);
            if next.is_none() || next.is_some_and(|&n| n.is_ascii_whitespace()) {
                return Some(i + 1);
            }
        }
    }
    None
}

/// True when a transcript reads as a complete sentence: it ends with
/// sentence-final punctuation or a configured completion token.
pub fn looks_complete(text: &str, completion_tokens: &[String]) -> bool {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.ends_with(['.', '!', '?']) {
        return true;
    }
    completion_tokens
        .iter()
        .any(|token| !token.is_empty() && trimmed.ends_with(token.as_str()))
}
