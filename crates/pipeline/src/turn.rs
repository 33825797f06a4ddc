//! Turn controller
//!
//! The single arbiter of who is speaking. Fuses VAD boundaries, STT finals,
//! the endpointing timer, and barge-in into one totally-ordered state
//! machine; the orchestrator runs it on a single task and executes the
//! actions it returns. One active speaker holds the floor at a time; while
//! the agent speaks, any participant may interrupt.

use std::collections::HashMap;

use confab_core::{ParticipantId, Utterance};

use crate::generator::looks_complete;

/// Turn controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Nobody holds the floor
    Idle,
    /// A participant is speaking
    Listening,
    /// Speech ended; waiting out the endpointing delay or an early commit
    Endpointing,
    /// Utterance committed; generation in flight, no audio yet
    Thinking,
    /// Assistant audio is flowing
    Speaking,
    /// Barge-in observed; waiting for the pipeline to confirm it stopped
    Interrupted,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Endpointing => "endpointing",
            TurnState::Thinking => "thinking",
            TurnState::Speaking => "speaking",
            TurnState::Interrupted => "interrupted",
        }
    }
}

/// Turn controller configuration
#[derive(Debug, Clone)]
pub struct TurnControllerConfig {
    /// Silence after SpeechEnd before a forced commit
    pub endpointing_delay_ms: u64,
    /// Minimum accrued silence before the early-commit predicate may fire
    pub min_commit_silence_ms: u64,
    /// Extra transcript suffixes treated as turn-complete
    pub completion_tokens: Vec<String>,
}

impl Default for TurnControllerConfig {
    fn default() -> Self {
        Self {
            endpointing_delay_ms: 2000,
            min_commit_silence_ms: 300,
            completion_tokens: Vec::new(),
        }
    }
}

impl TurnControllerConfig {
    pub fn from_settings(settings: &confab_config::TurnSettings) -> Self {
        Self {
            endpointing_delay_ms: settings.endpointing_delay_ms,
            min_commit_silence_ms: settings.min_commit_silence_ms,
            completion_tokens: settings.completion_tokens.clone(),
        }
    }
}

/// Inbound event. All times are session-clock milliseconds.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    SpeechStart {
        participant: ParticipantId,
        utterance_id: u64,
        at_ms: u64,
    },
    SpeechEnd {
        participant: ParticipantId,
        at_ms: u64,
    },
    SttInterim {
        participant: ParticipantId,
        utterance_id: u64,
        text: String,
    },
    SttFinal {
        participant: ParticipantId,
        utterance_id: u64,
        text: String,
        at_ms: u64,
    },
    SttUnavailable {
        participant: ParticipantId,
        utterance_id: u64,
    },
    EndpointTimerFired {
        at_ms: u64,
    },
    /// Generator emitted its first chunk
    FirstChunk {
        turn_id: u64,
    },
    /// Generator failed and nothing could be spoken in its place
    GeneratorFailed {
        turn_id: u64,
    },
    /// Generator drained and TTS drained
    TurnFinished {
        turn_id: u64,
    },
    /// Cancel acknowledged: synthesis stopped, generator closed
    TtsStopped {
        turn_id: u64,
        at_ms: u64,
    },
    ParticipantLeft {
        participant: ParticipantId,
    },
}

/// Action for the orchestrator to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnAction {
    /// Publish the state on `agent_status`
    EmitState {
        state: TurnState,
        turn_id: Option<u64>,
    },
    StartEndpointTimer {
        delay_ms: u64,
    },
    CancelEndpointTimer,
    /// The utterance is settled; finals arriving later are stale
    CloseUtterance {
        participant: ParticipantId,
    },
    /// Committed utterance: start generation
    BeginTurn {
        turn_id: u64,
        participant: ParticipantId,
        utterance_id: u64,
        text: String,
        /// SpeechEnd of the committed utterance, for latency accounting
        speech_end_at_ms: Option<u64>,
        last_final_at_ms: Option<u64>,
    },
    /// Stop the generator, synthesis, and egress for this turn
    CancelTurn {
        turn_id: u64,
    },
}

/// The turn state machine. Pure transitions; the orchestrator owns timers
/// and channels.
pub struct TurnController {
    config: TurnControllerConfig,
    state: TurnState,
    active_speaker: Option<ParticipantId>,
    /// Open utterance per participant, latest only
    utterances: HashMap<ParticipantId, Utterance>,
    /// Participants mid-speech per VAD, with their SpeechStart time
    speaking: HashMap<ParticipantId, u64>,
    /// When the active speaker's silence began
    silence_since_ms: Option<u64>,
    last_final_at_ms: Option<u64>,
    next_turn_id: u64,
    current_turn: Option<u64>,
    interrupter: Option<ParticipantId>,
}

impl TurnController {
    pub fn new(config: TurnControllerConfig) -> Self {
        Self {
            config,
            state: TurnState::Idle,
            active_speaker: None,
            utterances: HashMap::new(),
            speaking: HashMap::new(),
            silence_since_ms: None,
            last_final_at_ms: None,
            next_turn_id: 1,
            current_turn: None,
            interrupter: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn active_speaker(&self) -> Option<&ParticipantId> {
        self.active_speaker.as_ref()
    }

    pub fn current_turn(&self) -> Option<u64> {
        self.current_turn
    }

    /// Start an assistant-only turn (the session greeting). Only from Idle.
    pub fn begin_scripted_turn(&mut self) -> Option<(u64, Vec<TurnAction>)> {
        if self.state != TurnState::Idle {
            return None;
        }
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        self.current_turn = Some(turn_id);
        self.state = TurnState::Thinking;
        Some((turn_id, vec![self.emit_state()]))
    }

    /// Apply one event; returns the actions to execute, in order.
    pub fn handle_event(&mut self, event: TurnEvent) -> Vec<TurnAction> {
        match event {
            TurnEvent::SpeechStart {
                participant,
                utterance_id,
                at_ms,
            } => self.on_speech_start(participant, utterance_id, at_ms),
            TurnEvent::SpeechEnd { participant, at_ms } => self.on_speech_end(participant, at_ms),
            TurnEvent::SttInterim {
                participant,
                utterance_id,
                text,
            } => {
                if let Some(utterance) = self.utterances.get_mut(&participant) {
                    if utterance.id == utterance_id {
                        utterance.set_interim(&text);
                    }
                }
                Vec::new()
            }
            TurnEvent::SttFinal {
                participant,
                utterance_id,
                text,
                at_ms,
            } => self.on_stt_final(participant, utterance_id, text, at_ms),
            TurnEvent::SttUnavailable {
                participant,
                utterance_id,
            } => self.on_stt_unavailable(participant, utterance_id),
            TurnEvent::EndpointTimerFired { at_ms: _ } => {
                if self.state == TurnState::Endpointing {
                    self.commit_active()
                } else {
                    Vec::new()
                }
            }
            TurnEvent::FirstChunk { turn_id } => {
                if self.state == TurnState::Thinking && self.current_turn == Some(turn_id) {
                    self.state = TurnState::Speaking;
                    vec![self.emit_state()]
                } else {
                    Vec::new()
                }
            }
            TurnEvent::GeneratorFailed { turn_id } => {
                if self.current_turn == Some(turn_id)
                    && matches!(self.state, TurnState::Thinking | TurnState::Speaking)
                {
                    self.current_turn = None;
                    self.to_idle_and_adopt()
                } else {
                    Vec::new()
                }
            }
            TurnEvent::TurnFinished { turn_id } => {
                if self.current_turn == Some(turn_id)
                    && matches!(self.state, TurnState::Thinking | TurnState::Speaking)
                {
                    self.current_turn = None;
                    self.to_idle_and_adopt()
                } else {
                    Vec::new()
                }
            }
            TurnEvent::TtsStopped { turn_id, at_ms } => self.on_tts_stopped(turn_id, at_ms),
            TurnEvent::ParticipantLeft { participant } => self.on_participant_left(participant),
        }
    }

    fn on_speech_start(
        &mut self,
        participant: ParticipantId,
        utterance_id: u64,
        at_ms: u64,
    ) -> Vec<TurnAction> {
        self.speaking.insert(participant.clone(), at_ms);

        // Reuse the open utterance when this is a resumption, otherwise
        // start tracking a fresh one.
        let fresh = self
            .utterances
            .get(&participant)
            .map_or(true, |u| u.id != utterance_id);
        if fresh {
            self.utterances.insert(
                participant.clone(),
                Utterance::open(utterance_id, participant.clone(), at_ms),
            );
        }

        match self.state {
            TurnState::Idle => {
                self.active_speaker = Some(participant);
                self.state = TurnState::Listening;
                self.silence_since_ms = None;
                self.last_final_at_ms = None;
                vec![self.emit_state()]
            }
            TurnState::Endpointing if self.active_speaker.as_ref() == Some(&participant) => {
                self.state = TurnState::Listening;
                self.silence_since_ms = None;
                vec![TurnAction::CancelEndpointTimer, self.emit_state()]
            }
            TurnState::Speaking => {
                // Barge-in: any participant may interrupt.
                let Some(turn_id) = self.current_turn else {
                    return Vec::new();
                };
                self.interrupter = Some(participant);
                self.state = TurnState::Interrupted;
                vec![TurnAction::CancelTurn { turn_id }, self.emit_state()]
            }
            _ => Vec::new(),
        }
    }

    fn on_speech_end(&mut self, participant: ParticipantId, at_ms: u64) -> Vec<TurnAction> {
        self.speaking.remove(&participant);
        if let Some(utterance) = self.utterances.get_mut(&participant) {
            utterance.ended_at_ms = Some(at_ms);
        }

        if self.state == TurnState::Listening && self.active_speaker.as_ref() == Some(&participant)
        {
            self.state = TurnState::Endpointing;
            self.silence_since_ms = Some(at_ms);
            vec![
                TurnAction::StartEndpointTimer {
                    delay_ms: self.config.endpointing_delay_ms,
                },
                self.emit_state(),
            ]
        } else {
            Vec::new()
        }
    }

    fn on_stt_final(
        &mut self,
        participant: ParticipantId,
        utterance_id: u64,
        text: String,
        at_ms: u64,
    ) -> Vec<TurnAction> {
        let matches_open = match self.utterances.get_mut(&participant) {
            Some(utterance) if utterance.id == utterance_id => {
                utterance.push_final(&text);
                true
            }
            _ => false,
        };
        if !matches_open {
            return Vec::new();
        }

        if self.active_speaker.as_ref() == Some(&participant) {
            self.last_final_at_ms = Some(at_ms);
        }

        // Early commit: transcript reads complete and enough silence accrued.
        if self.state == TurnState::Endpointing
            && self.active_speaker.as_ref() == Some(&participant)
        {
            let silent_long_enough = self
                .silence_since_ms
                .is_some_and(|since| at_ms.saturating_sub(since) >= self.config.min_commit_silence_ms);
            let complete = self
                .utterances
                .get(&participant)
                .is_some_and(|u| looks_complete(u.latest_text(), &self.config.completion_tokens));
            if silent_long_enough && complete {
                let mut actions = vec![TurnAction::CancelEndpointTimer];
                actions.extend(self.commit_active());
                return actions;
            }
        }
        Vec::new()
    }

    fn on_stt_unavailable(
        &mut self,
        participant: ParticipantId,
        utterance_id: u64,
    ) -> Vec<TurnAction> {
        let matches_open = self
            .utterances
            .get(&participant)
            .is_some_and(|u| u.id == utterance_id);
        if !matches_open {
            return Vec::new();
        }
        self.utterances.remove(&participant);

        if self.active_speaker.as_ref() == Some(&participant)
            && matches!(self.state, TurnState::Listening | TurnState::Endpointing)
        {
            // No transcript will ever come; give up on the utterance.
            let mut actions = vec![
                TurnAction::CancelEndpointTimer,
                TurnAction::CloseUtterance {
                    participant: participant.clone(),
                },
            ];
            self.active_speaker = None;
            actions.extend(self.to_idle_and_adopt());
            actions
        } else {
            vec![TurnAction::CloseUtterance { participant }]
        }
    }

    fn on_tts_stopped(&mut self, turn_id: u64, at_ms: u64) -> Vec<TurnAction> {
        if self.state != TurnState::Interrupted || self.current_turn != Some(turn_id) {
            return Vec::new();
        }
        self.current_turn = None;

        match self.interrupter.take() {
            Some(interrupter) if self.utterances.contains_key(&interrupter) => {
                self.active_speaker = Some(interrupter.clone());
                self.last_final_at_ms = None;

                // The interrupter may already have fallen silent while the
                // pipeline unwound; SpeechEnd fires only once, so go
                // straight to Endpointing with the timer backdated to when
                // their silence began.
                let ended_at = if self.speaking.contains_key(&interrupter) {
                    None
                } else {
                    self.utterances
                        .get(&interrupter)
                        .and_then(|u| u.ended_at_ms)
                };
                if let Some(ended_at) = ended_at {
                    self.state = TurnState::Endpointing;
                    self.silence_since_ms = Some(ended_at);
                    let elapsed = at_ms.saturating_sub(ended_at);
                    let delay_ms = self.config.endpointing_delay_ms.saturating_sub(elapsed);
                    return vec![
                        TurnAction::StartEndpointTimer { delay_ms },
                        self.emit_state(),
                    ];
                }

                self.state = TurnState::Listening;
                self.silence_since_ms = None;
                vec![self.emit_state()]
            }
            // Interrupter left before the pipeline wound down
            _ => self.to_idle_and_adopt(),
        }
    }

    fn on_participant_left(&mut self, participant: ParticipantId) -> Vec<TurnAction> {
        self.speaking.remove(&participant);
        let had_utterance = self.utterances.remove(&participant).is_some();
        if self.interrupter.as_ref() == Some(&participant) {
            self.interrupter = None;
        }

        let mut actions = Vec::new();
        if had_utterance {
            actions.push(TurnAction::CloseUtterance {
                participant: participant.clone(),
            });
        }

        // Departure mid-utterance cancels it.
        if self.active_speaker.as_ref() == Some(&participant)
            && matches!(self.state, TurnState::Listening | TurnState::Endpointing)
        {
            if self.state == TurnState::Endpointing {
                actions.push(TurnAction::CancelEndpointTimer);
            }
            self.active_speaker = None;
            actions.extend(self.to_idle_and_adopt());
        }
        actions
    }

    /// Commit the active utterance with the best text available, or settle
    /// for no reply if it is blank.
    fn commit_active(&mut self) -> Vec<TurnAction> {
        let Some(participant) = self.active_speaker.take() else {
            return self.to_idle_and_adopt();
        };
        let Some(mut utterance) = self.utterances.remove(&participant) else {
            return self.to_idle_and_adopt();
        };

        let mut actions = vec![TurnAction::CloseUtterance {
            participant: participant.clone(),
        }];

        let text = utterance.latest_text().trim().to_string();
        if text.is_empty() {
            // Nothing transcribed: no-op commit, no response.
            actions.extend(self.to_idle_and_adopt());
            return actions;
        }

        utterance.complete = true;
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        self.current_turn = Some(turn_id);
        self.state = TurnState::Thinking;

        actions.push(TurnAction::BeginTurn {
            turn_id,
            participant,
            utterance_id: utterance.id,
            text,
            speech_end_at_ms: utterance.ended_at_ms,
            last_final_at_ms: self.last_final_at_ms,
        });
        actions.push(self.emit_state());
        actions
    }

    /// Enter Idle, then immediately hand the floor to whoever is already
    /// mid-speech (earliest SpeechStart wins).
    fn to_idle_and_adopt(&mut self) -> Vec<TurnAction> {
        self.state = TurnState::Idle;
        self.active_speaker = None;
        self.silence_since_ms = None;
        let mut actions = vec![self.emit_state()];

        let adopted = self
            .speaking
            .iter()
            .filter(|(p, _)| self.utterances.contains_key(*p))
            .min_by_key(|(_, &since)| since)
            .map(|(p, _)| p.clone());
        if let Some(participant) = adopted {
            self.active_speaker = Some(participant);
            self.state = TurnState::Listening;
            self.last_final_at_ms = None;
            actions.push(self.emit_state());
        }
        actions
    }

    fn emit_state(&self) -> TurnAction {
        TurnAction::EmitState {
            state: self.state,
            turn_id: self.current_turn,
        }
    }
}
