//! Chat-completion client

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::LlmError;

/// One message in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Token deltas from a streaming chat request.
///
/// The stream ends cleanly after the model signals done. Dropping the
/// receiver aborts the underlying request.
pub type TokenStream = mpsc::Receiver<Result<String, LlmError>>;

/// Streaming chat client, injectable for tests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream, LlmError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize, Default)]
struct ChatStreamLine {
    #[serde(default)]
    message: Option<MessageDelta>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct MessageDelta {
    #[serde(default)]
    content: String,
}

/// Client for an Ollama-compatible chat endpoint.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature,
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
            options: ChatOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!(
                "chat endpoint returned {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Http(e.to_string()))).await;
                        return;
                    }
                };
                buf.extend_from_slice(&bytes);

                while let Some(newline) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match parse_stream_line(line) {
                        Ok(parsed) => {
                            if let Some(delta) = parsed.message {
                                if !delta.content.is_empty()
                                    && tx.send(Ok(delta.content)).await.is_err()
                                {
                                    // Receiver dropped: caller cancelled.
                                    return;
                                }
                            }
                            if parsed.done {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }

            // Body ended without a done marker.
            let _ = tx
                .send(Err(LlmError::Malformed(
                    "stream ended without done marker".to_string(),
                )))
                .await;
        });

        Ok(rx)
    }
}

fn parse_stream_line(line: &str) -> Result<ChatStreamLine, LlmError> {
    serde_json::from_str(line).map_err(|e| LlmError::Malformed(format!("{e}: {line}")))
}
