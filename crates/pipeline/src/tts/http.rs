//! HTTP streaming synthesis client
//!
//! Piper-style API: `POST /api/synthesize/stream` returns raw i16le PCM
//! with the actual format in `X-Sample-Rate` / `X-Channels` /
//! `X-Sample-Width` headers.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{SynthesisStream, TtsClient};
use crate::PipelineError;

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    sample_rate: u32,
}

/// Client for a Piper-style streaming synthesizer.
pub struct PiperClient {
    http: reqwest::Client,
    base_url: String,
    voice: String,
    sample_rate_hz: u32,
}

impl PiperClient {
    pub fn new(base_url: impl Into<String>, voice: impl Into<String>, sample_rate_hz: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            voice: voice.into(),
            sample_rate_hz,
        }
    }
}

#[async_trait]
impl TtsClient for PiperClient {
    async fn synthesize(&self, text: &str) -> Result<SynthesisStream, PipelineError> {
        let url = format!("{}/api/synthesize/stream", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&SynthesizeRequest {
                text,
                voice: &self.voice,
                sample_rate: self.sample_rate_hz,
            })
            .send()
            .await
            .map_err(|e| PipelineError::Tts(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PipelineError::Tts(format!(
                "synthesis endpoint returned {}",
                response.status()
            )));
        }

        let sample_rate_hz = header_u32(&response, "X-Sample-Rate").unwrap_or(self.sample_rate_hz);
        let channels = header_u32(&response, "X-Channels").unwrap_or(1) as u8;
        let sample_width = header_u32(&response, "X-Sample-Width").unwrap_or(2);
        if sample_width != 2 {
            return Err(PipelineError::Tts(format!(
                "unsupported sample width {sample_width}"
            )));
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            // i16 samples may straddle network chunk boundaries
            let mut odd_byte: Option<u8> = None;

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(PipelineError::Tts(e.to_string()))).await;
                        return;
                    }
                };
                let (samples, leftover) = bytes_to_i16(odd_byte.take(), &bytes);
                odd_byte = leftover;
                if !samples.is_empty() && tx.send(Ok(samples)).await.is_err() {
                    // Receiver dropped: synthesis cancelled.
                    return;
                }
            }
        });

        Ok(SynthesisStream {
            sample_rate_hz,
            channels,
            pcm: rx,
        })
    }

    async fn health_check(&self) -> Result<(), PipelineError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Tts(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PipelineError::Tts(format!(
                "health endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn header_u32(response: &reqwest::Response, name: &str) -> Option<u32> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Assemble little-endian i16 samples, carrying a trailing odd byte over to
/// the next chunk.
fn bytes_to_i16(carry: Option<u8>, bytes: &[u8]) -> (Vec<i16>, Option<u8>) {
    let mut samples = Vec::with_capacity((bytes.len() + 1) / 2);
    let mut iter = bytes.iter().copied();

    if let Some(low) = carry {
        match iter.next() {
            Some(high) => samples.push(i16::from_le_bytes([low, high])),
            None => return (samples, Some(low)),
        }
    }

    let mut leftover = None;
    loop {
        match (iter.next(), iter.next()) {
            (Some(low), Some(high)) => samples.push(i16::from_le_bytes([low, high])),
            (Some(low), None) => {
                leftover = Some(low);
                break;
            }
            _ => break,
        }
    }
    (samples, leftover)
}
