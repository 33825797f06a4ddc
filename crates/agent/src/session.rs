//! Session lifecycle
//!
//! One session joins one room as the agent: it consumes room events from
//! the media transport, feeds the pipeline, publishes synthesized audio
//! and telemetry back, and drains when the room empties.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use confab_config::Settings;
use confab_core::{ParticipantId, TelemetryEvent};
use confab_pipeline::{EngineClients, SessionPipeline, SessionPipelineConfig, TurnState};
use confab_transport::{MediaEvent, MediaTransport};

use crate::{AgentError, Supervisor};

/// One room's agent session.
pub struct Session;

/// Handle to a running session.
pub struct SessionHandle {
    room: String,
    pipeline: Arc<SessionPipeline>,
    supervisor: Arc<Supervisor>,
    drain: Duration,
}

impl Session {
    /// Validate configuration, probe the synthesizer, and start the
    /// session. A failed probe is fatal: the supervisor does not rejoin.
    pub async fn start(
        room: impl Into<String>,
        settings: Settings,
        transport: Arc<dyn MediaTransport>,
        clients: EngineClients,
    ) -> Result<SessionHandle, AgentError> {
        let room = room.into();
        settings.validate()?;

        clients
            .tts
            .health_check()
            .await
            .map_err(|e| AgentError::Startup(format!("TTS endpoint: {e}")))?;

        let supervisor = Arc::new(Supervisor::new());
        let (telemetry_tx, telemetry_rx) = mpsc::channel::<TelemetryEvent>(256);
        let pipeline = SessionPipeline::new(
            SessionPipelineConfig::from_settings(&settings),
            clients,
            telemetry_tx,
        );

        let (event_tx, event_rx) = mpsc::channel::<MediaEvent>(1024);
        transport.set_event_sink(event_tx);

        let drain = Duration::from_millis(settings.timeouts.drain_ms);
        supervisor.register(tokio::spawn(run_event_pump(
            Arc::clone(&pipeline),
            Arc::clone(&supervisor),
            event_rx,
            drain,
        )));
        supervisor.register(tokio::spawn(run_telemetry_pump(
            Arc::clone(&transport),
            Arc::clone(&supervisor),
            telemetry_rx,
        )));
        supervisor.register(tokio::spawn(run_audio_publisher(
            Arc::clone(&transport),
            Arc::clone(&pipeline),
            settings.publish.sample_rate_hz,
        )));

        if let Some(greeting) = settings.dialogue.greeting.as_deref() {
            pipeline.speak_scripted(greeting).await;
        }

        tracing::info!(room = %room, "session started");
        Ok(SessionHandle {
            room,
            pipeline,
            supervisor,
            drain,
        })
    }
}

impl SessionHandle {
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn turn_state(&self) -> TurnState {
        self.pipeline.turn_state()
    }

    pub fn participant_count(&self) -> usize {
        self.pipeline.participant_count()
    }

    /// Out-of-band telemetry stream (what the UI would read off the data
    /// channel, before serialization).
    pub fn subscribe_telemetry(&self) -> tokio::sync::broadcast::Receiver<TelemetryEvent> {
        self.supervisor.subscribe_telemetry()
    }

    /// Snapshot of the dialogue context, for inspection.
    pub fn dialogue_snapshot(&self) -> Vec<confab_core::DialogueTurn> {
        self.pipeline.dialogue().snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.supervisor.is_shut_down()
    }

    /// Close the session: drain the current turn, then stop everything.
    pub async fn close(&self) {
        self.pipeline.shutdown(self.drain).await;
        self.supervisor.shut_down().await;
    }
}

/// Room event pump: participants and audio in, drain when the room empties.
async fn run_event_pump(
    pipeline: Arc<SessionPipeline>,
    supervisor: Arc<Supervisor>,
    mut events: mpsc::Receiver<MediaEvent>,
    drain: Duration,
) {
    let mut present: HashSet<ParticipantId> = HashSet::new();
    let mut anyone_joined = false;
    let mut shutdown = supervisor.shutdown_signal();

    loop {
        let event = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            MediaEvent::ParticipantJoined { identity, sid, .. } => {
                anyone_joined = true;
                present.insert(identity.clone());
                pipeline.add_participant(identity, sid);
            }
            MediaEvent::ParticipantLeft { identity } => {
                present.remove(&identity);
                pipeline.remove_participant(&identity);
                if anyone_joined && present.is_empty() {
                    tracing::info!("room empty, draining session");
                    pipeline.shutdown(drain).await;
                    // Reap from a detached task so this one can finish first
                    let supervisor = Arc::clone(&supervisor);
                    tokio::spawn(async move { supervisor.shut_down().await });
                    break;
                }
            }
            MediaEvent::AudioFrame {
                identity,
                pcm,
                sample_rate_hz,
                channels,
                capture_ts_ms,
            } => {
                pipeline.route_audio(&identity, &pcm, sample_rate_hz, channels, capture_ts_ms);
            }
            MediaEvent::Disconnected { reason } => {
                tracing::warn!(reason = %reason, "room connection lost, closing session");
                pipeline.shutdown(Duration::ZERO).await;
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move { supervisor.shut_down().await });
                break;
            }
        }
    }
}

/// Telemetry pump: serialize onto the data channels, fan out locally.
async fn run_telemetry_pump(
    transport: Arc<dyn MediaTransport>,
    supervisor: Arc<Supervisor>,
    mut telemetry: mpsc::Receiver<TelemetryEvent>,
) {
    let fan_out = supervisor.telemetry_sender();
    while let Some(event) = telemetry.recv().await {
        let _ = fan_out.send(event.clone());
        match event.to_payload() {
            Ok(payload) => {
                if let Err(e) = transport.publish_data(event.topic(), &payload).await {
                    tracing::warn!(error = %e, topic = event.topic(), "telemetry publish failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "telemetry serialization failed"),
        }
    }
}

/// Outbound audio: hand egress frames to the room track.
async fn run_audio_publisher(
    transport: Arc<dyn MediaTransport>,
    pipeline: Arc<SessionPipeline>,
    sample_rate_hz: u32,
) {
    let egress = pipeline.egress();
    while let Some(frame) = egress.next_frame().await {
        if let Err(e) = transport
            .publish_audio_frame(&frame.pcm, sample_rate_hz, 1)
            .await
        {
            tracing::warn!(error = %e, "audio publish failed");
        }
    }
}
