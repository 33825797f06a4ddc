//! End-to-end session scenarios with injected engine doubles
//!
//! Every external engine (media transport, recognizer, model,
//! synthesizer) is a scripted fake; the clock is paused, so timing
//! assertions are deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use confab_agent::Session;
use confab_config::Settings;
use confab_core::{ParticipantId, TelemetryEvent};
use confab_llm::{ChatMessage, LlmClient, LlmError, TokenStream};
use confab_pipeline::{
    EngineClients, PipelineError, SttClient, SttSegment, SttSink, SttSource, SynthesisStream,
    TtsClient,
};
use confab_transport::{MediaEvent, MediaTransport, TransportError};

const APOLOGY_TEXT: &str = "Sorry, I had trouble answering. Could you repeat that?";

// ---------------------------------------------------------------------------
// Media transport double

struct FakeTransport {
    event_tx: Mutex<Option<mpsc::Sender<MediaEvent>>>,
    epoch: Instant,
    published_frames: Mutex<Vec<u64>>,
    data_messages: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            event_tx: Mutex::new(None),
            epoch: Instant::now(),
            published_frames: Mutex::new(Vec::new()),
            data_messages: Mutex::new(Vec::new()),
        })
    }

    async fn emit(&self, event: MediaEvent) {
        let tx = self.event_tx.lock().clone().expect("no event sink set");
        tx.send(event).await.expect("event pump gone");
    }

    fn frames_published(&self) -> usize {
        self.published_frames.lock().len()
    }

    fn data_on_topic(&self, topic: &str) -> Vec<serde_json::Value> {
        self.data_messages
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn set_event_sink(&self, tx: mpsc::Sender<MediaEvent>) {
        *self.event_tx.lock() = Some(tx);
    }

    async fn publish_audio_frame(
        &self,
        _pcm: &[i16],
        _sample_rate_hz: u32,
        _channels: u8,
    ) -> Result<(), TransportError> {
        self.published_frames
            .lock()
            .push(self.epoch.elapsed().as_millis() as u64);
        Ok(())
    }

    async fn publish_data(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let value = serde_json::from_slice(payload).expect("telemetry payload is JSON");
        self.data_messages.lock().push((topic.to_string(), value));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recognizer double

enum SttScriptItem {
    Segments(Vec<SttSegment>),
    Disconnect,
}

#[derive(Default)]
struct SttScript {
    items: Mutex<VecDeque<SttScriptItem>>,
    fail_next_connects: Mutex<u32>,
    connects: Mutex<u32>,
}

impl SttScript {
    fn push_final(&self, text: &str) {
        self.items
            .lock()
            .push_back(SttScriptItem::Segments(vec![SttSegment {
                text: text.to_string(),
                start: 0.0,
                end: 1.0,
                completed: true,
            }]));
    }

    fn push_interim(&self, text: &str) {
        self.items
            .lock()
            .push_back(SttScriptItem::Segments(vec![SttSegment {
                text: text.to_string(),
                start: 0.0,
                end: 1.0,
                completed: false,
            }]));
    }

    fn disconnect(&self) {
        self.items.lock().push_back(SttScriptItem::Disconnect);
    }

    fn connects(&self) -> u32 {
        *self.connects.lock()
    }
}

#[derive(Default)]
struct FakeStt {
    scripts: Mutex<HashMap<ParticipantId, Arc<SttScript>>>,
}

impl FakeStt {
    fn script_for(&self, identity: &str) -> Arc<SttScript> {
        Arc::clone(
            self.scripts
                .lock()
                .entry(ParticipantId::from(identity))
                .or_default(),
        )
    }
}

struct NullSink;

#[async_trait]
impl SttSink for NullSink {
    async fn send_audio(&mut self, _pcm_le: Vec<u8>) -> Result<(), PipelineError> {
        Ok(())
    }
    async fn flush(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

struct ScriptSource {
    script: Arc<SttScript>,
}

#[async_trait]
impl SttSource for ScriptSource {
    async fn next_segments(&mut self) -> Result<Option<Vec<SttSegment>>, PipelineError> {
        loop {
            let item = self.script.items.lock().pop_front();
            match item {
                Some(SttScriptItem::Segments(segments)) => return Ok(Some(segments)),
                Some(SttScriptItem::Disconnect) => {
                    return Err(PipelineError::Stt("connection dropped".to_string()))
                }
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }
}

#[async_trait]
impl SttClient for FakeStt {
    async fn connect(
        &self,
        participant: &ParticipantId,
    ) -> Result<(Box<dyn SttSink>, Box<dyn SttSource>), PipelineError> {
        let script = Arc::clone(self.scripts.lock().entry(participant.clone()).or_default());
        {
            let mut fail = script.fail_next_connects.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(PipelineError::Stt("connection refused".to_string()));
            }
        }
        *script.connects.lock() += 1;
        Ok((
            Box::new(NullSink),
            Box::new(ScriptSource { script }),
        ))
    }
}

// ---------------------------------------------------------------------------
// Model double

enum LlmMode {
    /// Tokens played back with a fixed inter-token delay
    Respond(Vec<String>, Duration),
    /// Never produces a token
    Stall,
}

struct FakeLlm {
    mode: Mutex<LlmMode>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeLlm {
    fn respond(tokens: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(LlmMode::Respond(
                tokens.iter().map(|t| t.to_string()).collect(),
                Duration::from_millis(10),
            )),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn stalled() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(LlmMode::Stall),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn set_response(&self, tokens: &[&str], delay: Duration) {
        *self.mode.lock() = LlmMode::Respond(tokens.iter().map(|t| t.to_string()).collect(), delay);
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn last_user_message(&self) -> Option<String> {
        self.requests
            .lock()
            .last()
            .and_then(|messages| messages.last())
            .map(|m| m.content.clone())
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream, LlmError> {
        self.requests.lock().push(messages);
        let (tx, rx) = mpsc::channel(8);
        let script = match &*self.mode.lock() {
            LlmMode::Respond(tokens, delay) => Some((tokens.clone(), *delay)),
            LlmMode::Stall => None,
        };
        tokio::spawn(async move {
            match script {
                Some((tokens, delay)) => {
                    for token in tokens {
                        tokio::time::sleep(delay).await;
                        if tx.send(Ok(token)).await.is_err() {
                            return;
                        }
                    }
                }
                None => {
                    // Hold the stream open without ever producing a token
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    drop(tx);
                }
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Synthesizer double

struct FakeTts {
    synth_calls: Mutex<Vec<String>>,
}

impl FakeTts {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            synth_calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.synth_calls.lock().clone()
    }
}

#[async_trait]
impl TtsClient for FakeTts {
    async fn synthesize(&self, text: &str) -> Result<SynthesisStream, PipelineError> {
        self.synth_calls.lock().push(text.to_string());
        let (tx, rx) = mpsc::channel(4);
        // 480 samples per character at 48kHz: ~10ms of audio per character
        let total = text.chars().count().max(1) * 480;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(Ok(vec![500i16; total / 2])).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(Ok(vec![500i16; total - total / 2])).await;
        });
        Ok(SynthesisStream {
            sample_rate_hz: 48_000,
            channels: 1,
            pcm: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    transport: Arc<FakeTransport>,
    stt: Arc<FakeStt>,
    llm: Arc<FakeLlm>,
    tts: Arc<FakeTts>,
    session: confab_agent::SessionHandle,
    telemetry: broadcast::Receiver<TelemetryEvent>,
    epoch: Instant,
}

async fn start_session(llm: Arc<FakeLlm>) -> Harness {
    let transport = FakeTransport::new();
    let stt = Arc::new(FakeStt::default());
    let tts = FakeTts::new();
    let epoch = Instant::now();

    let clients = EngineClients {
        stt: Arc::clone(&stt) as Arc<dyn SttClient>,
        llm: Arc::clone(&llm) as Arc<dyn LlmClient>,
        tts: Arc::clone(&tts) as Arc<dyn TtsClient>,
    };
    let session = Session::start(
        "test-room",
        Settings::default(),
        Arc::clone(&transport) as Arc<dyn MediaTransport>,
        clients,
    )
    .await
    .expect("session starts");
    let telemetry = session.subscribe_telemetry();

    Harness {
        transport,
        stt,
        llm,
        tts,
        session,
        telemetry,
        epoch,
    }
}

impl Harness {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn join(&self, identity: &str, sid: &str) {
        self.transport
            .emit(MediaEvent::ParticipantJoined {
                identity: ParticipantId::from(identity),
                sid: sid.to_string(),
                display_name: None,
            })
            .await;
        // Let the pump register the participant
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn leave(&self, identity: &str) {
        self.transport
            .emit(MediaEvent::ParticipantLeft {
                identity: ParticipantId::from(identity),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    /// Stream 20ms frames of loud audio, advancing the paused clock in step
    /// so capture timestamps line up with session time.
    async fn send_speech(&self, identity: &str, ms: u64) {
        for _ in 0..(ms / 20) {
            let pcm: Vec<i16> = (0..320)
                .map(|i| ((i as f32 * 0.7).sin() * 9000.0) as i16)
                .collect();
            self.transport
                .emit(MediaEvent::AudioFrame {
                    identity: ParticipantId::from(identity),
                    pcm,
                    sample_rate_hz: 16_000,
                    channels: 1,
                    capture_ts_ms: self.now_ms(),
                })
                .await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn send_silence(&self, identity: &str, ms: u64) {
        for _ in 0..(ms / 20) {
            self.transport
                .emit(MediaEvent::AudioFrame {
                    identity: ParticipantId::from(identity),
                    pcm: vec![0i16; 320],
                    sample_rate_hz: 16_000,
                    channels: 1,
                    capture_ts_ms: self.now_ms(),
                })
                .await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until the agent publishes the given state, failing after a
    /// generous (paused-clock) deadline.
    async fn wait_for_state(&mut self, state: &str) {
        let deadline = Duration::from_secs(30);
        let result = tokio::time::timeout(deadline, async {
            loop {
                match self.telemetry.recv().await {
                    Ok(TelemetryEvent::Status(status)) if status.state == state => return,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("telemetry closed while waiting for state {state}")
                    }
                }
            }
        })
        .await;
        result.unwrap_or_else(|_| panic!("timed out waiting for state {state}"));
    }

    fn user_finals(&self) -> Vec<(String, String)> {
        self.transport
            .data_on_topic("transcripts")
            .into_iter()
            .filter(|m| m["speaker"] == "user" && m.get("interim").is_none())
            .map(|m| {
                (
                    m["participantIdentity"].as_str().unwrap_or_default().to_string(),
                    m["text"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    fn assistant_transcripts(&self) -> Vec<String> {
        self.transport
            .data_on_topic("transcripts")
            .into_iter()
            .filter(|m| m["speaker"] == "assistant")
            .map(|m| m["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn latency_reports(&self) -> Vec<serde_json::Value> {
        self.transport
            .data_on_topic("agent_status")
            .into_iter()
            .filter(|m| m.get("latencies").is_some())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test(start_paused = true)]
async fn greeting_round_trip() {
    let mut h = start_session(FakeLlm::respond(&["Hi", " there!", " Doing", " well."])).await;
    h.join("alice", "PA_alice").await;

    h.send_speech("alice", 1200).await;
    h.send_silence("alice", 400).await;
    h.stt.script_for("alice").push_final("Hello, how are you?");

    h.wait_for_state("thinking").await;
    h.wait_for_state("speaking").await;
    h.wait_for_state("idle").await;

    // One user final with the full sentence
    let finals = h.user_finals();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0], ("alice".to_string(), "Hello, how are you?".to_string()));

    // Assistant transcript went out, audio went out
    let assistant = h.assistant_transcripts();
    assert_eq!(assistant, vec!["Hi there! Doing well.".to_string()]);
    assert!(h.transport.frames_published() > 0);

    // Latency breakdown published and plausible
    let reports = h.latency_reports();
    assert_eq!(reports.len(), 1);
    let latencies = &reports[0]["latencies"];
    assert!(latencies["e2e_ms"].as_u64().unwrap() > 0);
    assert!(latencies["llm_ttft_ms"].as_u64().unwrap() > 0);
}

#[tokio::test(start_paused = true)]
async fn thinking_pause_commits_one_utterance() {
    let mut h = start_session(FakeLlm::respond(&["Of", " course."])).await;
    h.join("alice", "PA_alice").await;

    h.send_speech("alice", 800).await;
    h.send_silence("alice", 400).await;
    // Incomplete transcript arrives during the pause
    h.stt.script_for("alice").push_final("Hello, I want to");
    // The pause continues but never reaches the endpointing delay
    h.send_silence("alice", 1400).await;
    // The user resumes
    h.send_speech("alice", 1100).await;
    h.send_silence("alice", 400).await;
    h.stt.script_for("alice").push_final("book an appointment.");

    h.wait_for_state("thinking").await;
    h.wait_for_state("idle").await;

    // Exactly one committed utterance, concatenated across the pause
    assert_eq!(h.llm.request_count(), 1);
    assert_eq!(
        h.llm.last_user_message().unwrap(),
        "Hello, I want to book an appointment."
    );
    assert_eq!(h.assistant_transcripts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn barge_in_stops_audio_and_yields_floor() {
    // Slow, many-token response so the agent is mid-speech when interrupted
    let tokens: Vec<String> = (0..60).map(|i| format!("word{i} ")).collect();
    let token_refs: Vec<&str> = tokens.iter().map(|s| s.as_str()).collect();
    let llm = FakeLlm::respond(&token_refs);
    llm.set_response(&token_refs, Duration::from_millis(100));
    let mut h = start_session(llm).await;
    h.join("alice", "PA_alice").await;

    h.send_speech("alice", 600).await;
    h.send_silence("alice", 400).await;
    h.stt.script_for("alice").push_final("Tell me a long story.");

    h.wait_for_state("speaking").await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // User speaks over the agent
    h.send_speech("alice", 200).await;
    h.wait_for_state("interrupted").await;
    h.wait_for_state("listening").await;

    // No orphan audio: the frame count settles once the cancel lands
    tokio::time::sleep(Duration::from_millis(200)).await;
    let frames_after_cancel = h.transport.frames_published();
    h.send_silence("alice", 600).await;
    assert_eq!(h.transport.frames_published(), frames_after_cancel);

    // The truncated assistant text is kept, tagged
    assert!(h
        .session
        .dialogue_snapshot()
        .iter()
        .any(|turn| turn.truncated));

    // The interruption drives a fresh turn
    h.llm.set_response(&["Okay."], Duration::from_millis(10));
    h.stt.script_for("alice").push_final("Stop.");
    h.wait_for_state("thinking").await;
    h.wait_for_state("idle").await;

    assert_eq!(h.llm.request_count(), 2);
    assert_eq!(h.llm.last_user_message().unwrap(), "Stop.");
}

#[tokio::test(start_paused = true)]
async fn quick_interjection_commits_after_barge_in() {
    // Slow, many-token response so the agent is mid-speech when interrupted
    let tokens: Vec<String> = (0..60).map(|i| format!("word{i} ")).collect();
    let token_refs: Vec<&str> = tokens.iter().map(|s| s.as_str()).collect();
    let llm = FakeLlm::respond(&token_refs);
    llm.set_response(&token_refs, Duration::from_millis(100));
    let mut h = start_session(llm).await;
    h.join("alice", "PA_alice").await;

    h.send_speech("alice", 600).await;
    h.send_silence("alice", 400).await;
    h.stt.script_for("alice").push_final("Tell me a long story.");

    h.wait_for_state("speaking").await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // A short "Stop." style interjection: the user falls silent right away,
    // without waiting for the cancelled turn to drain. Their SpeechEnd may
    // land while the controller is still unwinding the cancel; the turn
    // must still endpoint and commit.
    h.llm.set_response(&["Okay."], Duration::from_millis(10));
    h.send_speech("alice", 200).await;
    h.send_silence("alice", 600).await;
    h.stt.script_for("alice").push_final("Stop.");

    h.wait_for_state("thinking").await;
    h.wait_for_state("idle").await;

    assert_eq!(h.llm.request_count(), 2);
    assert_eq!(h.llm.last_user_message().unwrap(), "Stop.");
    assert_eq!(h.assistant_transcripts().last().unwrap(), "Okay.");
}

#[tokio::test(start_paused = true)]
async fn stt_dropout_reconnects_and_concatenates() {
    let mut h = start_session(FakeLlm::respond(&["Noted."])).await;
    h.join("alice", "PA_alice").await;

    h.send_speech("alice", 1400).await;
    h.stt.script_for("alice").push_final("I was saying");
    // Connection drops mid-utterance
    h.stt.script_for("alice").disconnect();
    h.send_speech("alice", 1400).await;
    h.send_silence("alice", 400).await;
    h.stt.script_for("alice").push_final("and here is more.");

    h.wait_for_state("thinking").await;
    h.wait_for_state("idle").await;

    // One reconnect, finals concatenated into a single commit
    assert_eq!(h.stt.script_for("alice").connects(), 2);
    assert_eq!(h.llm.request_count(), 1);
    assert_eq!(
        h.llm.last_user_message().unwrap(),
        "I was saying and here is more."
    );
}

#[tokio::test(start_paused = true)]
async fn stt_outage_yields_no_response() {
    let mut h = start_session(FakeLlm::respond(&["never spoken"])).await;
    h.join("alice", "PA_alice").await;
    // Every reconnect attempt fails once the stream drops
    *h.stt.script_for("alice").fail_next_connects.lock() = u32::MAX;
    h.stt.script_for("alice").disconnect();

    h.send_speech("alice", 1000).await;
    h.send_silence("alice", 400).await;

    // Retries exhaust and the controller settles back to idle without a turn
    h.wait_for_state("idle").await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.llm.request_count(), 0);
    assert!(h.assistant_transcripts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn llm_stall_speaks_apology() {
    let mut h = start_session(FakeLlm::stalled()).await;
    h.join("alice", "PA_alice").await;

    h.send_speech("alice", 800).await;
    h.send_silence("alice", 400).await;
    h.stt.script_for("alice").push_final("Tell me something.");

    h.wait_for_state("thinking").await;
    // First-token deadline passes, apology is synthesized instead
    h.wait_for_state("idle").await;

    assert_eq!(h.assistant_transcripts(), vec![APOLOGY_TEXT.to_string()]);
    assert!(h.tts.calls().iter().any(|text| text == APOLOGY_TEXT));
    // The dialogue records a failure marker, not real content
    assert!(h.session.dialogue_snapshot().iter().any(|turn| turn.failed));
}

#[tokio::test(start_paused = true)]
async fn two_speakers_one_turn() {
    let mut h = start_session(FakeLlm::respond(&["Sunny", " today."])).await;
    h.join("alice", "PA_alice").await;
    h.join("bob", "PA_bob").await;

    // Alice starts 120ms before Bob; both overlap
    h.send_speech("alice", 120).await;
    tokio::join!(h.send_speech("alice", 800), h.send_speech("bob", 700));
    tokio::join!(h.send_silence("alice", 400), h.send_silence("bob", 400));

    h.stt.script_for("bob").push_final("Hello.");
    h.stt.script_for("alice").push_final("What's the weather?");

    h.wait_for_state("thinking").await;
    h.wait_for_state("idle").await;

    // Alice drives the one and only turn
    assert_eq!(h.llm.request_count(), 1);
    assert_eq!(h.llm.last_user_message().unwrap(), "What's the weather?");

    // Bob's speech is still transcribed and published under his identity
    let finals = h.user_finals();
    assert!(finals.contains(&("bob".to_string(), "Hello.".to_string())));
    assert_eq!(h.assistant_transcripts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn greeting_config_speaks_on_start() {
    let transport = FakeTransport::new();
    let stt = Arc::new(FakeStt::default());
    let tts = FakeTts::new();
    let llm = FakeLlm::respond(&["unused"]);

    let mut settings = Settings::default();
    settings.dialogue.greeting = Some("Hello! How can I help?".to_string());

    let session = Session::start(
        "greeting-room",
        settings,
        Arc::clone(&transport) as Arc<dyn MediaTransport>,
        EngineClients {
            stt: stt as Arc<dyn SttClient>,
            llm: llm as Arc<dyn LlmClient>,
            tts: Arc::clone(&tts) as Arc<dyn TtsClient>,
        },
    )
    .await
    .unwrap();
    let mut telemetry = session.subscribe_telemetry();

    // The greeting runs as a normal turn: thinking -> speaking -> idle
    let deadline = Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        loop {
            if let Ok(TelemetryEvent::Status(status)) = telemetry.recv().await {
                if status.state == "idle" {
                    break;
                }
            }
        }
    })
    .await
    .expect("greeting turn completes");

    assert!(tts.calls().iter().any(|t| t == "Hello! How can I help?"));
    assert!(transport.frames_published() > 0);
}

#[tokio::test(start_paused = true)]
async fn empty_room_drains_session() {
    let h = start_session(FakeLlm::respond(&["unused"])).await;
    h.join("alice", "PA_alice").await;
    assert_eq!(h.session.participant_count(), 1);

    h.leave("alice").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.session.is_closed());
}

#[tokio::test(start_paused = true)]
async fn transcripts_match_wire_shape() {
    let mut h = start_session(FakeLlm::respond(&["Fine."])).await;
    h.join("alice", "PA_alice").await;

    h.send_speech("alice", 600).await;
    h.stt.script_for("alice").push_interim("how are");
    h.send_silence("alice", 400).await;
    h.stt.script_for("alice").push_final("How are you?");

    h.wait_for_state("idle").await;

    let messages = h.transport.data_on_topic("transcripts");
    let interim = messages
        .iter()
        .find(|m| m.get("interim").is_some())
        .expect("interim transcript published");
    assert_eq!(interim["type"], "transcript");
    assert_eq!(interim["speaker"], "user");
    assert_eq!(interim["participantIdentity"], "alice");
    assert_eq!(interim["participantSid"], "PA_alice");
    assert_eq!(interim["interim"], true);

    let speaker_values: Vec<&str> = messages
        .iter()
        .filter_map(|m| m["speaker"].as_str())
        .collect();
    assert!(speaker_values.contains(&"assistant"));
}
