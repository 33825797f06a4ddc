//! WhisperLive WebSocket client
//!
//! Wire protocol: JSON handshake on connect, then binary i16le PCM frames
//! up and JSON segment batches down. `{"eof": true}` asks the server to
//! flush pending segments. Server-side VAD stays disabled; the pipeline's
//! own VAD decides speech boundaries.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use confab_core::ParticipantId;

use super::{SttClient, SttSegment, SttSink, SttSource};
use crate::PipelineError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct Handshake<'a> {
    uid: &'a str,
    language: &'a str,
    task: &'a str,
    model: &'a str,
    use_vad: bool,
}

#[derive(Deserialize)]
struct ServerMessage {
    #[serde(default)]
    segments: Option<Vec<WireSegment>>,
}

#[derive(Deserialize)]
struct WireSegment {
    #[serde(default)]
    text: String,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    completed: bool,
}

/// Client for a WhisperLive-style recognizer.
pub struct WhisperLiveClient {
    url: String,
    language: String,
    model: String,
}

impl WhisperLiveClient {
    pub fn new(url: impl Into<String>, language: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            language: language.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl SttClient for WhisperLiveClient {
    async fn connect(
        &self,
        participant: &ParticipantId,
    ) -> Result<(Box<dyn SttSink>, Box<dyn SttSource>), PipelineError> {
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| PipelineError::Stt(format!("connect {}: {e}", self.url)))?;
        let (mut write, read) = ws.split();

        let uid = uuid::Uuid::new_v4().to_string();
        let handshake = Handshake {
            uid: &uid,
            language: &self.language,
            task: "transcribe",
            model: &self.model,
            use_vad: false,
        };
        let payload = serde_json::to_string(&handshake)
            .map_err(|e| PipelineError::Stt(e.to_string()))?;
        write
            .send(Message::Text(payload))
            .await
            .map_err(|e| PipelineError::Stt(format!("handshake: {e}")))?;

        tracing::info!(
            %participant,
            url = %self.url,
            model = %self.model,
            "STT stream opened"
        );

        Ok((
            Box::new(WhisperLiveSink { write }),
            Box::new(WhisperLiveSource { read }),
        ))
    }
}

struct WhisperLiveSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SttSink for WhisperLiveSink {
    async fn send_audio(&mut self, pcm_le: Vec<u8>) -> Result<(), PipelineError> {
        self.write
            .send(Message::Binary(pcm_le))
            .await
            .map_err(|e| PipelineError::Stt(e.to_string()))
    }

    async fn flush(&mut self) -> Result<(), PipelineError> {
        self.write
            .send(Message::Text(r#"{"eof":true}"#.to_string()))
            .await
            .map_err(|e| PipelineError::Stt(e.to_string()))
    }
}

struct WhisperLiveSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl SttSource for WhisperLiveSource {
    async fn next_segments(&mut self) -> Result<Option<Vec<SttSegment>>, PipelineError> {
        while let Some(message) = self.read.next().await {
            let message = message.map_err(|e| PipelineError::Stt(e.to_string()))?;
            match message {
                Message::Text(text) => {
                    if let Some(segments) = parse_segments(&text) {
                        return Ok(Some(segments));
                    }
                    // Status messages without segments are skipped.
                }
                Message::Close(_) => return Ok(None),
                // Ping/pong handled by the library; binary is unexpected.
                _ => {}
            }
        }
        Ok(None)
    }
}

fn parse_segments(text: &str) -> Option<Vec<SttSegment>> {
    let parsed: ServerMessage = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable STT message");
            return None;
        }
    };
    let segments = parsed.segments?;
    Some(
        segments
            .into_iter()
            .map(|s| SttSegment {
                text: s.text,
                start: s.start,
                end: s.end,
                completed: s.completed,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_batch() {
        let segments = parse_segments(
            r#"{"segments":[{"text":"hello","start":0.0,"end":0.8,"completed":false},{"text":"hello there","start":0.0,"end":1.2,"completed":true}]}"#,
        )
        .unwrap();
        assert_eq!(segments.len(), 2);
        assert!(!segments[0].completed);
        assert!(segments[1].completed);
        assert_eq!(segments[1].text, "hello there");
    }

    #[test]
    fn test_parse_skips_status_messages() {
        assert!(parse_segments(r#"{"message":"SERVER_READY"}"#).is_none());
        assert!(parse_segments("not json").is_none());
    }

    #[test]
    fn test_handshake_shape() {
        let handshake = Handshake {
            uid: "abc",
            language: "en",
            task: "transcribe",
            model: "small",
            use_vad: false,
        };
        let json: serde_json::Value =
            serde_json::to_value(&handshake).unwrap();
        assert_eq!(json["use_vad"], false);
        assert_eq!(json["task"], "transcribe");
        assert_eq!(json["model"], "small");
    }
}
