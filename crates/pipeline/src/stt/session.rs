//! Per-participant recognition session
//!
//! Owns the connection lifecycle and the attribution of recognizer output
//! to utterances. Runs as one task per participant; the send and receive
//! sides share the loop via select, so ordering within the session is total.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use confab_core::{AudioFrame, ParticipantId};

use super::{SttClient, SttEvent, SttSegment, SttSink, SttSource};
use crate::PipelineError;

/// Recognition session configuration
#[derive(Debug, Clone)]
pub struct SttSessionConfig {
    /// Tear the connection down after this much time with no open utterance
    pub idle_timeout: Duration,
    /// First reconnect delay
    pub backoff_initial: Duration,
    /// Reconnect delay ceiling
    pub backoff_cap: Duration,
    /// Connection attempts allowed per utterance
    pub max_attempts: u32,
    /// Handshake deadline per attempt
    pub handshake_timeout: Duration,
}

impl Default for SttSessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(4),
            max_attempts: 5,
            handshake_timeout: Duration::from_secs(3),
        }
    }
}

/// Commands into a recognition session.
#[derive(Debug)]
pub enum SttCommand {
    /// A new utterance opened; audio that follows belongs to it
    OpenUtterance { id: u64 },
    /// PCM to forward (speech plus hangover)
    Audio(AudioFrame),
    /// Hangover elapsed; flush pending segments
    Flush,
    /// The utterance was committed or cancelled; finals arriving after this
    /// are stale
    CloseUtterance,
}

type Connection = (Box<dyn SttSink>, Box<dyn SttSource>);

enum Step {
    Command(Option<SttCommand>),
    Read(Result<Option<Vec<SttSegment>>, PipelineError>),
    IdleExpired,
}

/// Per-participant recognition session actor.
pub struct SttSession {
    participant: ParticipantId,
    client: Arc<dyn SttClient>,
    config: SttSessionConfig,
    events: mpsc::Sender<SttEvent>,

    conn: Option<Connection>,
    active_utterance: Option<u64>,
    /// Finals seen, keyed by (utterance id, text hash)
    seen_finals: HashSet<(u64, u64)>,
    /// Connection attempts spent on the current utterance
    attempts_spent: u32,
    idle_since: Instant,
}

impl SttSession {
    pub fn new(
        participant: ParticipantId,
        client: Arc<dyn SttClient>,
        config: SttSessionConfig,
        events: mpsc::Sender<SttEvent>,
    ) -> Self {
        Self {
            participant,
            client,
            config,
            events,
            conn: None,
            active_utterance: None,
            seen_finals: HashSet::new(),
            attempts_spent: 0,
            idle_since: Instant::now(),
        }
    }

    /// Drive the session until the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SttCommand>) {
        loop {
            let idle_deadline = self.idle_since + self.config.idle_timeout;
            let step = if let Some((_, source)) = self.conn.as_mut() {
                tokio::select! {
                    cmd = commands.recv() => Step::Command(cmd),
                    read = source.next_segments() => Step::Read(read),
                    _ = tokio::time::sleep_until(idle_deadline),
                        if self.active_utterance.is_none() => Step::IdleExpired,
                }
            } else {
                Step::Command(commands.recv().await)
            };

            match step {
                Step::Command(None) => break,
                Step::Command(Some(cmd)) => {
                    // On failure, Unavailable was already emitted; wait for
                    // the next utterance to try again.
                    let _ = self.handle_command(cmd).await;
                }
                Step::Read(read) => self.handle_read(read).await,
                Step::IdleExpired => {
                    tracing::debug!(participant = %self.participant, "STT connection idle, closing");
                    self.conn = None;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SttCommand) -> Result<(), PipelineError> {
        match cmd {
            SttCommand::OpenUtterance { id } => {
                self.active_utterance = Some(id);
                self.attempts_spent = 0;
                if self.conn.is_none() {
                    self.reconnect().await?;
                }
            }
            SttCommand::Audio(frame) => {
                if self.active_utterance.is_none() {
                    return Ok(());
                }
                if self.conn.is_none() {
                    self.reconnect().await?;
                }
                let bytes = frame.to_le_bytes();
                if let Some((sink, _)) = self.conn.as_mut() {
                    if let Err(e) = sink.send_audio(bytes).await {
                        tracing::warn!(participant = %self.participant, error = %e, "STT send failed, reconnecting");
                        self.conn = None;
                        self.reconnect().await?;
                    }
                }
            }
            SttCommand::Flush => {
                if let Some((sink, _)) = self.conn.as_mut() {
                    if let Err(e) = sink.flush().await {
                        tracing::warn!(participant = %self.participant, error = %e, "STT flush failed");
                        self.conn = None;
                    }
                }
            }
            SttCommand::CloseUtterance => {
                self.active_utterance = None;
                self.idle_since = Instant::now();
            }
        }
        Ok(())
    }

    async fn handle_read(&mut self, read: Result<Option<Vec<SttSegment>>, PipelineError>) {
        match read {
            Ok(Some(segments)) => {
                for segment in segments {
                    self.dispatch_segment(segment).await;
                }
            }
            Ok(None) => {
                tracing::info!(participant = %self.participant, "STT connection closed by server");
                self.conn = None;
                if self.active_utterance.is_some() {
                    let _ = self.reconnect().await;
                }
            }
            Err(e) => {
                tracing::warn!(participant = %self.participant, error = %e, "STT read error");
                self.conn = None;
                if self.active_utterance.is_some() {
                    let _ = self.reconnect().await;
                }
            }
        }
    }

    async fn dispatch_segment(&mut self, segment: SttSegment) {
        let Some(utterance_id) = self.active_utterance else {
            if segment.completed {
                tracing::warn!(
                    participant = %self.participant,
                    text = %segment.text,
                    "dropping stale final for closed utterance"
                );
            }
            return;
        };

        if segment.completed {
            let key = (utterance_id, text_hash(&segment.text));
            if !self.seen_finals.insert(key) {
                // Duplicate delivery of the same final; drop silently.
                return;
            }
            let _ = self
                .events
                .send(SttEvent::Final {
                    participant: self.participant.clone(),
                    utterance_id,
                    text: segment.text,
                })
                .await;
        } else {
            let _ = self
                .events
                .send(SttEvent::Interim {
                    participant: self.participant.clone(),
                    utterance_id,
                    text: segment.text,
                })
                .await;
        }
    }

    /// Connect with exponential backoff, bounded per utterance. On
    /// exhaustion emits `Unavailable` and abandons the utterance.
    async fn reconnect(&mut self) -> Result<(), PipelineError> {
        let mut delay = self.config.backoff_initial;

        while self.attempts_spent < self.config.max_attempts {
            self.attempts_spent += 1;
            match tokio::time::timeout(
                self.config.handshake_timeout,
                self.client.connect(&self.participant),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    self.conn = Some(conn);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        participant = %self.participant,
                        attempt = self.attempts_spent,
                        error = %e,
                        "STT connect failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        participant = %self.participant,
                        attempt = self.attempts_spent,
                        "STT handshake timed out"
                    );
                }
            }
            if self.attempts_spent >= self.config.max_attempts {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.backoff_cap);
        }

        if let Some(utterance_id) = self.active_utterance.take() {
            let _ = self
                .events
                .send(SttEvent::Unavailable {
                    participant: self.participant.clone(),
                    utterance_id,
                })
                .await;
        }
        Err(PipelineError::SttUnavailable)
    }
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}
