//! Session pipeline orchestrator
//!
//! Wires one room's worth of pipeline: per-participant ingress+VAD tasks,
//! recognition sessions, the turn-controller loop, and per-turn
//! generator/speaker tasks. The turn controller's loop is the only writer
//! of turn state; everything else communicates with it over its event
//! queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use confab_config::Settings;
use confab_core::{
    AgentStatusMessage, DialogueTurn, ParticipantId, Role, SharedDialogue, TelemetryEvent,
    TranscriptMessage, TurnLatency,
};
use confab_llm::{build_messages, LlmClient};
use confab_transport::{AudioEgress, EgressConfig, FrameQueue, IngressConfig, IngressRouter};

use crate::generator::{run_generator, GeneratorConfig, GeneratorOutcome, SpeakChunk};
use crate::stt::{SttClient, SttCommand, SttEvent, SttSession, SttSessionConfig};
use crate::tts::{SpeakOutcome, SpeakStats, Speaker, SpeakerConfig, TtsClient};
use crate::turn::{TurnAction, TurnController, TurnControllerConfig, TurnEvent, TurnState};
use crate::vad::{VadConfig, VoiceActivityDetector};

const APOLOGY_TEXT: &str = "Sorry, I had trouble answering. Could you repeat that?";

/// The three engine clients a session talks to.
#[derive(Clone)]
pub struct EngineClients {
    pub stt: Arc<dyn SttClient>,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
}

/// Orchestrator configuration, derived from [`Settings`].
#[derive(Clone)]
pub struct SessionPipelineConfig {
    pub vad: VadConfig,
    pub turn: TurnControllerConfig,
    pub generator: GeneratorConfig,
    pub speaker: SpeakerConfig,
    pub stt_session: SttSessionConfig,
    pub ingress: IngressConfig,
    pub egress: EgressConfig,
    /// Audio keeps flowing to STT this long after SpeechEnd
    pub hangover_ms: u64,
    /// Outbound audio must stop within this after barge-in
    pub barge_in_deadline: Duration,
    /// Dialogue bounds
    pub dialogue_max_turns: usize,
    pub dialogue_max_chars: usize,
    pub system_preamble: String,
    /// Identity the assistant's transcripts are published under
    pub agent_identity: String,
}

impl Default for SessionPipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl SessionPipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            vad: VadConfig::from_settings(&settings.vad),
            turn: TurnControllerConfig::from_settings(&settings.turn),
            generator: GeneratorConfig::from_settings(&settings.timeouts),
            speaker: SpeakerConfig {
                publish_sample_rate_hz: settings.publish.sample_rate_hz,
                first_byte_timeout: Duration::from_millis(settings.timeouts.tts_first_byte_ms),
                ..SpeakerConfig::default()
            },
            stt_session: SttSessionConfig {
                handshake_timeout: Duration::from_millis(settings.timeouts.stt_handshake_ms),
                ..SttSessionConfig::default()
            },
            ingress: IngressConfig::default(),
            egress: EgressConfig::default(),
            hangover_ms: settings.turn.stt_hangover_ms,
            barge_in_deadline: Duration::from_millis(settings.turn.barge_in_deadline_ms),
            dialogue_max_turns: settings.dialogue.max_turns,
            dialogue_max_chars: settings.dialogue.max_chars,
            system_preamble: settings.dialogue.system_preamble.clone(),
            agent_identity: "agent".to_string(),
        }
    }
}

/// Message into the turn-controller loop.
enum TcMessage {
    Event(TurnEvent),
    /// Assistant-only turn with fixed text (session greeting)
    Scripted { text: String },
}

struct ParticipantShared {
    sid: String,
    stt_cmd: mpsc::Sender<SttCommand>,
    utterance_open: Arc<AtomicBool>,
    queue: Arc<FrameQueue>,
}

type ParticipantMap = Arc<RwLock<HashMap<ParticipantId, ParticipantShared>>>;

/// Everything per-turn tasks need.
struct TurnDeps {
    llm: Arc<dyn LlmClient>,
    speaker: Arc<Speaker>,
    dialogue: SharedDialogue,
    tc_tx: mpsc::Sender<TcMessage>,
    telemetry_tx: mpsc::Sender<TelemetryEvent>,
    generator: GeneratorConfig,
    epoch: Instant,
    agent_identity: String,
}

/// One session's pipeline.
pub struct SessionPipeline {
    config: SessionPipelineConfig,
    clients: EngineClients,
    ingress: Arc<IngressRouter>,
    egress: Arc<AudioEgress>,
    dialogue: SharedDialogue,
    participants: ParticipantMap,
    tc_tx: mpsc::Sender<TcMessage>,
    stt_event_tx: mpsc::Sender<SttEvent>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<TurnState>,
    epoch: Instant,
    draining: AtomicBool,
}

impl SessionPipeline {
    /// Build the pipeline and start its long-lived tasks.
    pub fn new(
        config: SessionPipelineConfig,
        clients: EngineClients,
        telemetry_tx: mpsc::Sender<TelemetryEvent>,
    ) -> Arc<Self> {
        let epoch = Instant::now();
        let ingress = Arc::new(IngressRouter::new(config.ingress.clone()));
        let egress = Arc::new(AudioEgress::new(config.egress.clone()));
        let dialogue = SharedDialogue::new(
            Some(&config.system_preamble),
            config.dialogue_max_turns,
            config.dialogue_max_chars,
        );
        let participants: ParticipantMap = Arc::new(RwLock::new(HashMap::new()));

        let (tc_tx, tc_rx) = mpsc::channel(256);
        let (stt_event_tx, stt_event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(TurnState::Idle);

        let speaker = Arc::new(Speaker::new(
            Arc::clone(&clients.tts),
            Arc::clone(&egress),
            config.speaker.clone(),
        ));
        let deps = Arc::new(TurnDeps {
            llm: Arc::clone(&clients.llm),
            speaker,
            dialogue: dialogue.clone(),
            tc_tx: tc_tx.clone(),
            telemetry_tx: telemetry_tx.clone(),
            generator: config.generator.clone(),
            epoch,
            agent_identity: config.agent_identity.clone(),
        });

        // Turn-controller loop: the single writer of turn state.
        tokio::spawn(run_turn_loop(
            TurnController::new(config.turn.clone()),
            tc_rx,
            deps,
            Arc::clone(&participants),
            Arc::clone(&egress),
            telemetry_tx.clone(),
            state_tx,
            config.barge_in_deadline,
            shutdown_rx.clone(),
        ));

        // Recognition event pump: transcripts out, turn events in.
        tokio::spawn(run_stt_pump(
            stt_event_rx,
            tc_tx.clone(),
            telemetry_tx.clone(),
            Arc::clone(&participants),
            epoch,
        ));

        Arc::new(Self {
            config,
            clients,
            ingress,
            egress,
            dialogue,
            participants,
            tc_tx,
            stt_event_tx,
            shutdown_tx,
            state_rx,
            epoch,
            draining: AtomicBool::new(false),
        })
    }

    /// Outbound audio queue, for the publisher task.
    pub fn egress(&self) -> Arc<AudioEgress> {
        Arc::clone(&self.egress)
    }

    pub fn dialogue(&self) -> &SharedDialogue {
        &self.dialogue
    }

    pub fn turn_state(&self) -> TurnState {
        *self.state_rx.borrow()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.read().len()
    }

    /// Register a participant and start its ingress+VAD and recognition
    /// tasks.
    pub fn add_participant(&self, identity: ParticipantId, sid: impl Into<String>) {
        let queue = self.ingress.register(identity.clone());
        let (stt_cmd_tx, stt_cmd_rx) = mpsc::channel(256);
        let utterance_open = Arc::new(AtomicBool::new(false));

        let stt_session = SttSession::new(
            identity.clone(),
            Arc::clone(&self.clients.stt),
            self.config.stt_session.clone(),
            self.stt_event_tx.clone(),
        );
        tokio::spawn(stt_session.run(stt_cmd_rx));

        tokio::spawn(run_participant(
            identity.clone(),
            Arc::clone(&queue),
            VoiceActivityDetector::with_energy_scorer(identity.clone(), self.config.vad.clone()),
            self.config.hangover_ms,
            stt_cmd_tx.clone(),
            Arc::clone(&utterance_open),
            self.tc_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        self.participants.write().insert(
            identity.clone(),
            ParticipantShared {
                sid: sid.into(),
                stt_cmd: stt_cmd_tx,
                utterance_open,
                queue,
            },
        );
        tracing::info!(participant = %identity, "participant joined pipeline");
    }

    /// Unregister a participant: close its queue, end its tasks, and let
    /// the turn controller settle.
    pub fn remove_participant(&self, identity: &ParticipantId) {
        self.ingress.unregister(identity);
        if let Some(shared) = self.participants.write().remove(identity) {
            shared.queue.close();
        }
        let _ = self.tc_tx.try_send(TcMessage::Event(TurnEvent::ParticipantLeft {
            participant: identity.clone(),
        }));
        tracing::info!(participant = %identity, "participant left pipeline");
    }

    /// Route one frame of room audio into the pipeline. Unknown identities
    /// are logged and dropped; during drain all audio is dropped.
    pub fn route_audio(
        &self,
        identity: &ParticipantId,
        pcm: &[i16],
        sample_rate_hz: u32,
        channels: u8,
        capture_ts_ms: u64,
    ) {
        if self.draining.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self
            .ingress
            .route(identity, pcm, sample_rate_hz, channels, capture_ts_ms)
        {
            tracing::warn!(participant = %identity, error = %e, "dropping audio frame");
        }
    }

    /// Speak a fixed assistant line (the session greeting) through the
    /// normal turn machinery, so barge-in works during it.
    pub async fn speak_scripted(&self, text: impl Into<String>) {
        let _ = self
            .tc_tx
            .send(TcMessage::Scripted { text: text.into() })
            .await;
    }

    /// Graceful drain: stop accepting audio, give the current turn up to
    /// `drain` to finish, then cancel everything.
    pub async fn shutdown(&self, drain: Duration) {
        self.draining.store(true, Ordering::Release);

        let mut state_rx = self.state_rx.clone();
        let _ = tokio::time::timeout(drain, async {
            loop {
                if *state_rx.borrow() == TurnState::Idle {
                    break;
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        let _ = self.shutdown_tx.send(true);
        let participants: Vec<ParticipantId> = self.participants.read().keys().cloned().collect();
        for identity in participants {
            self.remove_participant(&identity);
        }
        self.egress.close();
        tracing::info!("session pipeline shut down");
    }

    /// Milliseconds since the session epoch.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Per-participant ingress+VAD task: classify frames, open utterances,
/// gate what reaches the recognizer (speech plus hangover).
#[allow(clippy::too_many_arguments)]
async fn run_participant(
    identity: ParticipantId,
    queue: Arc<FrameQueue>,
    mut vad: VoiceActivityDetector,
    hangover_ms: u64,
    stt_cmd: mpsc::Sender<SttCommand>,
    utterance_open: Arc<AtomicBool>,
    tc_tx: mpsc::Sender<TcMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut utterance_seq: u64 = 0;
    let mut hangover_until: Option<u64> = None;

    loop {
        let frame = tokio::select! {
            _ = crate::await_cancelled(&mut shutdown) => break,
            frame = queue.pop() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let frame_end_ms = frame.capture_ts_ms + frame.duration_ms();

        for event in vad.push_frame(&frame) {
            match event {
                crate::vad::VadEvent::SpeechStart { at_ms, .. } => {
                    if !utterance_open.load(Ordering::Acquire) {
                        utterance_seq += 1;
                        utterance_open.store(true, Ordering::Release);
                        let _ = stt_cmd
                            .send(SttCommand::OpenUtterance { id: utterance_seq })
                            .await;
                    }
                    hangover_until = None;
                    let _ = tc_tx
                        .send(TcMessage::Event(TurnEvent::SpeechStart {
                            participant: identity.clone(),
                            utterance_id: utterance_seq,
                            at_ms,
                        }))
                        .await;
                }
                crate::vad::VadEvent::SpeechEnd { at_ms, .. } => {
                    hangover_until = Some(frame_end_ms + hangover_ms);
                    let _ = tc_tx
                        .send(TcMessage::Event(TurnEvent::SpeechEnd {
                            participant: identity.clone(),
                            at_ms,
                        }))
                        .await;
                }
            }
        }

        let in_hangover = hangover_until.is_some_and(|until| frame.capture_ts_ms < until);
        if utterance_open.load(Ordering::Acquire) && (vad.in_speech() || in_hangover) {
            let _ = stt_cmd.send(SttCommand::Audio(frame)).await;
        }

        if let Some(until) = hangover_until {
            if frame_end_ms >= until {
                hangover_until = None;
                let _ = stt_cmd.send(SttCommand::Flush).await;
            }
        }
    }
}

/// Pump recognition events: publish user transcripts, feed the controller.
async fn run_stt_pump(
    mut stt_events: mpsc::Receiver<SttEvent>,
    tc_tx: mpsc::Sender<TcMessage>,
    telemetry_tx: mpsc::Sender<TelemetryEvent>,
    participants: ParticipantMap,
    epoch: Instant,
) {
    while let Some(event) = stt_events.recv().await {
        match event {
            SttEvent::Interim {
                participant,
                utterance_id,
                text,
            } => {
                let sid = participant_sid(&participants, &participant);
                let _ = telemetry_tx
                    .send(TelemetryEvent::Transcript(TranscriptMessage::user(
                        &participant,
                        &sid,
                        text.clone(),
                        true,
                    )))
                    .await;
                let _ = tc_tx
                    .send(TcMessage::Event(TurnEvent::SttInterim {
                        participant,
                        utterance_id,
                        text,
                    }))
                    .await;
            }
            SttEvent::Final {
                participant,
                utterance_id,
                text,
            } => {
                let sid = participant_sid(&participants, &participant);
                let _ = telemetry_tx
                    .send(TelemetryEvent::Transcript(TranscriptMessage::user(
                        &participant,
                        &sid,
                        text.clone(),
                        false,
                    )))
                    .await;
                let _ = tc_tx
                    .send(TcMessage::Event(TurnEvent::SttFinal {
                        participant,
                        utterance_id,
                        text,
                        at_ms: epoch.elapsed().as_millis() as u64,
                    }))
                    .await;
            }
            SttEvent::Unavailable {
                participant,
                utterance_id,
            } => {
                let _ = tc_tx
                    .send(TcMessage::Event(TurnEvent::SttUnavailable {
                        participant,
                        utterance_id,
                    }))
                    .await;
            }
        }
    }
}

fn participant_sid(participants: &ParticipantMap, identity: &ParticipantId) -> String {
    participants
        .read()
        .get(identity)
        .map(|p| p.sid.clone())
        .unwrap_or_default()
}

struct ActiveTurn {
    turn_id: u64,
    cancel_tx: watch::Sender<bool>,
}

/// The turn-controller loop: applies events, owns the endpointing timer,
/// spawns and cancels turn tasks.
#[allow(clippy::too_many_arguments)]
async fn run_turn_loop(
    mut controller: TurnController,
    mut rx: mpsc::Receiver<TcMessage>,
    deps: Arc<TurnDeps>,
    participants: ParticipantMap,
    egress: Arc<AudioEgress>,
    telemetry_tx: mpsc::Sender<TelemetryEvent>,
    state_tx: watch::Sender<TurnState>,
    barge_in_deadline: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut endpoint_deadline: Option<Instant> = None;
    let mut active_turn: Option<ActiveTurn> = None;
    // Pending barge-in stop acknowledgment, for the deadline watchdog
    let mut cancel_ack: Option<(u64, Arc<AtomicBool>)> = None;
    let epoch = deps.epoch;

    loop {
        let message = tokio::select! {
            _ = crate::await_cancelled(&mut shutdown) => break,
            _ = async {
                match endpoint_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                endpoint_deadline = None;
                TcMessage::Event(TurnEvent::EndpointTimerFired {
                    at_ms: epoch.elapsed().as_millis() as u64,
                })
            }
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let TcMessage::Event(TurnEvent::TtsStopped { turn_id, .. }) = &message {
            if let Some((pending, flag)) = cancel_ack.as_ref() {
                if pending == turn_id {
                    flag.store(true, Ordering::Release);
                    cancel_ack = None;
                }
            }
        }

        let actions = match message {
            TcMessage::Event(event) => controller.handle_event(event),
            TcMessage::Scripted { text } => match controller.begin_scripted_turn() {
                Some((turn_id, actions)) => {
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    egress.begin_turn(turn_id);
                    active_turn = Some(ActiveTurn { turn_id, cancel_tx });
                    tokio::spawn(run_scripted_turn(Arc::clone(&deps), turn_id, text, cancel_rx));
                    actions
                }
                None => {
                    tracing::warn!("scripted turn requested while busy, dropped");
                    Vec::new()
                }
            },
        };

        for action in actions {
            match action {
                TurnAction::EmitState { state, turn_id } => {
                    let _ = state_tx.send(state);
                    let _ = telemetry_tx
                        .send(TelemetryEvent::Status(AgentStatusMessage {
                            state: state.as_str().to_string(),
                            turn_id,
                            latencies: None,
                        }))
                        .await;
                }
                TurnAction::StartEndpointTimer { delay_ms } => {
                    endpoint_deadline = Some(Instant::now() + Duration::from_millis(delay_ms));
                }
                TurnAction::CancelEndpointTimer => {
                    endpoint_deadline = None;
                }
                TurnAction::CloseUtterance { participant } => {
                    let cmd = {
                        let participants = participants.read();
                        participants.get(&participant).map(|shared| {
                            shared.utterance_open.store(false, Ordering::Release);
                            shared.stt_cmd.clone()
                        })
                    };
                    if let Some(cmd) = cmd {
                        let _ = cmd.send(SttCommand::CloseUtterance).await;
                    }
                }
                TurnAction::BeginTurn {
                    turn_id,
                    participant,
                    utterance_id: _,
                    text,
                    speech_end_at_ms,
                    last_final_at_ms,
                } => {
                    deps.dialogue.push_user(text.clone());
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    egress.begin_turn(turn_id);
                    active_turn = Some(ActiveTurn { turn_id, cancel_tx });
                    tokio::spawn(run_turn_task(
                        Arc::clone(&deps),
                        turn_id,
                        participant,
                        text,
                        speech_end_at_ms,
                        last_final_at_ms,
                        cancel_rx,
                    ));
                }
                TurnAction::CancelTurn { turn_id } => {
                    if let Some(active) = active_turn.as_ref() {
                        if active.turn_id == turn_id {
                            // Clear the queue first so outbound audio stops
                            // inside the barge-in deadline; the tasks unwind
                            // behind it.
                            egress.cancel_turn(turn_id);
                            let _ = active.cancel_tx.send(true);

                            // Watchdog: if the pipeline misses the stop
                            // deadline, log it and force the transition so
                            // the state machine is never stuck.
                            let acked = Arc::new(AtomicBool::new(false));
                            cancel_ack = Some((turn_id, Arc::clone(&acked)));
                            let tc_tx = deps.tc_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(barge_in_deadline).await;
                                if !acked.load(Ordering::Acquire) {
                                    tracing::warn!(
                                        turn_id,
                                        deadline_ms = barge_in_deadline.as_millis() as u64,
                                        "barge-in stop missed its deadline, forcing transition"
                                    );
                                    let _ = tc_tx
                                        .send(TcMessage::Event(TurnEvent::TtsStopped {
                                            turn_id,
                                            at_ms: epoch.elapsed().as_millis() as u64,
                                        }))
                                        .await;
                                }
                            });
                        }
                    }
                }
            }
        }
    }

    // Session ending: take the current turn down with it.
    if let Some(active) = active_turn.take() {
        egress.cancel_turn(active.turn_id);
        let _ = active.cancel_tx.send(true);
    }
}

/// One user turn: generation feeding synthesis, then bookkeeping.
async fn run_turn_task(
    deps: Arc<TurnDeps>,
    turn_id: u64,
    _participant: ParticipantId,
    user_text: String,
    speech_end_at_ms: Option<u64>,
    last_final_at_ms: Option<u64>,
    cancel_rx: watch::Receiver<bool>,
) {
    let messages = build_messages(&deps.dialogue.snapshot(), &user_text);

    let (gen_tx, mut gen_rx) = mpsc::channel::<SpeakChunk>(16);
    let (spk_tx, spk_rx) = mpsc::channel::<SpeakChunk>(16);

    let generator = tokio::spawn(run_generator(
        Arc::clone(&deps.llm),
        messages,
        deps.generator.clone(),
        gen_tx,
        cancel_rx.clone(),
    ));
    let speaker_task = {
        let deps = Arc::clone(&deps);
        let cancel_rx = cancel_rx.clone();
        tokio::spawn(async move { deps.speaker.speak_turn(turn_id, spk_rx, cancel_rx).await })
    };

    // Relay chunks, flagging the first one to the controller.
    let mut first = true;
    while let Some(chunk) = gen_rx.recv().await {
        if first {
            first = false;
            let _ = deps
                .tc_tx
                .send(TcMessage::Event(TurnEvent::FirstChunk { turn_id }))
                .await;
        }
        if spk_tx.send(chunk).await.is_err() {
            break;
        }
    }
    drop(spk_tx);

    let outcome = match generator.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(turn_id, error = %e, "generator task panicked");
            let _ = deps
                .tc_tx
                .send(TcMessage::Event(TurnEvent::GeneratorFailed { turn_id }))
                .await;
            return;
        }
    };
    let speak = match speaker_task.await {
        Ok(speak) => speak,
        Err(e) => {
            tracing::error!(turn_id, error = %e, "speaker task panicked");
            let _ = deps
                .tc_tx
                .send(TcMessage::Event(TurnEvent::GeneratorFailed { turn_id }))
                .await;
            return;
        }
    };

    let cancelled = outcome.truncated || matches!(speak, SpeakOutcome::Cancelled(_));
    if cancelled {
        finish_cancelled(&deps, turn_id, &outcome).await;
        return;
    }

    if let Some(error) = &outcome.error {
        let spoke_anything = matches!(&speak, SpeakOutcome::Completed(stats) if stats.chunks_spoken > 0);
        if !spoke_anything {
            tracing::warn!(turn_id, error = %error, "generation failed, speaking apology");
            run_apology_turn(&deps, turn_id, cancel_rx).await;
            return;
        }
        // Partial output made it out (total-timeout case): close the turn
        // with what was said, tagged truncated.
        tracing::warn!(turn_id, error = %error, "generation failed after partial speech");
        deps.dialogue
            .push_assistant(DialogueTurn::truncated(Role::Assistant, outcome.text.clone()));
        publish_assistant_transcript(&deps, &outcome.text).await;
        let _ = deps
            .tc_tx
            .send(TcMessage::Event(TurnEvent::TurnFinished { turn_id }))
            .await;
        return;
    }

    // Clean completion.
    deps.dialogue
        .push_assistant(DialogueTurn::new(Role::Assistant, outcome.text.clone()));
    publish_assistant_transcript(&deps, &outcome.text).await;
    publish_latencies(&deps, turn_id, speech_end_at_ms, last_final_at_ms, &outcome, &speak).await;
    let _ = deps
        .tc_tx
        .send(TcMessage::Event(TurnEvent::TurnFinished { turn_id }))
        .await;
}

/// Barge-in unwind: keep the truncated text, acknowledge the stop.
async fn finish_cancelled(deps: &Arc<TurnDeps>, turn_id: u64, outcome: &GeneratorOutcome) {
    if !outcome.text.trim().is_empty() {
        deps.dialogue
            .push_assistant(DialogueTurn::truncated(Role::Assistant, outcome.text.clone()));
        publish_assistant_transcript(deps, &outcome.text).await;
    }
    let _ = deps
        .tc_tx
        .send(TcMessage::Event(TurnEvent::TtsStopped {
            turn_id,
            at_ms: deps.epoch.elapsed().as_millis() as u64,
        }))
        .await;
}

/// Canned apology when the model produced nothing usable.
async fn run_apology_turn(deps: &Arc<TurnDeps>, turn_id: u64, cancel_rx: watch::Receiver<bool>) {
    deps.dialogue
        .push_assistant(DialogueTurn::failure_marker(APOLOGY_TEXT));

    let (tx, rx) = mpsc::channel(1);
    let _ = tx
        .send(SpeakChunk {
            index: 0,
            text: APOLOGY_TEXT.to_string(),
            is_final: true,
        })
        .await;
    drop(tx);

    let _ = deps
        .tc_tx
        .send(TcMessage::Event(TurnEvent::FirstChunk { turn_id }))
        .await;
    let outcome = deps.speaker.speak_turn(turn_id, rx, cancel_rx).await;
    publish_assistant_transcript(deps, APOLOGY_TEXT).await;

    let event = match outcome {
        SpeakOutcome::Completed(_) => TurnEvent::TurnFinished { turn_id },
        SpeakOutcome::Cancelled(_) => TurnEvent::TtsStopped {
            turn_id,
            at_ms: deps.epoch.elapsed().as_millis() as u64,
        },
    };
    let _ = deps.tc_tx.send(TcMessage::Event(event)).await;
}

/// Scripted assistant-only turn (the greeting).
async fn run_scripted_turn(
    deps: Arc<TurnDeps>,
    turn_id: u64,
    text: String,
    cancel_rx: watch::Receiver<bool>,
) {
    deps.dialogue
        .push_assistant(DialogueTurn::new(Role::Assistant, text.clone()));

    let (tx, rx) = mpsc::channel(1);
    let _ = tx
        .send(SpeakChunk {
            index: 0,
            text: text.clone(),
            is_final: true,
        })
        .await;
    drop(tx);

    let _ = deps
        .tc_tx
        .send(TcMessage::Event(TurnEvent::FirstChunk { turn_id }))
        .await;
    let outcome = deps.speaker.speak_turn(turn_id, rx, cancel_rx).await;
    publish_assistant_transcript(&deps, &text).await;

    let event = match outcome {
        SpeakOutcome::Completed(_) => TurnEvent::TurnFinished { turn_id },
        SpeakOutcome::Cancelled(_) => TurnEvent::TtsStopped {
            turn_id,
            at_ms: deps.epoch.elapsed().as_millis() as u64,
        },
    };
    let _ = deps.tc_tx.send(TcMessage::Event(event)).await;
}

async fn publish_assistant_transcript(deps: &Arc<TurnDeps>, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let _ = deps
        .telemetry_tx
        .send(TelemetryEvent::Transcript(TranscriptMessage::assistant(
            &deps.agent_identity,
            "",
            text,
        )))
        .await;
}

async fn publish_latencies(
    deps: &Arc<TurnDeps>,
    turn_id: u64,
    speech_end_at_ms: Option<u64>,
    last_final_at_ms: Option<u64>,
    outcome: &GeneratorOutcome,
    speak: &SpeakOutcome,
) {
    let stats: &SpeakStats = match speak {
        SpeakOutcome::Completed(stats) | SpeakOutcome::Cancelled(stats) => stats,
    };
    let first_audio_ms = stats
        .first_audio_at
        .map(|at| at.duration_since(deps.epoch).as_millis() as u64);

    let latencies = TurnLatency {
        stt_ms: match (speech_end_at_ms, last_final_at_ms) {
            (Some(end), Some(last_final)) => last_final.saturating_sub(end),
            _ => 0,
        },
        llm_ttft_ms: outcome.ttft_ms.unwrap_or(0),
        llm_total_ms: outcome.total_ms,
        tts_ttfb_ms: stats.ttfb_ms.unwrap_or(0),
        e2e_ms: match (speech_end_at_ms, first_audio_ms) {
            (Some(end), Some(first)) => first.saturating_sub(end),
            _ => 0,
        },
    };

    let _ = deps
        .telemetry_tx
        .send(TelemetryEvent::Status(AgentStatusMessage {
            state: TurnState::Speaking.as_str().to_string(),
            turn_id: Some(turn_id),
            latencies: Some(latencies),
        }))
        .await;
}
