//! Voice Activity Detection
//!
//! Fixed-window speech/silence classification with run-length hysteresis.
//! The scorer is pluggable; the default scores short-term energy, which is
//! cheap enough to colocate with ingress on the same task. Decoupling speech
//! detection from STT is what makes barge-in possible before any transcript
//! arrives.

use confab_core::{AudioFrame, ParticipantId};

/// VAD configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Speech score threshold (0.0 - 1.0)
    pub activation_threshold: f32,
    /// Window size in milliseconds
    pub window_ms: u64,
    /// Speech run needed for the silence-to-speech transition (ms)
    pub min_speech_ms: u64,
    /// Silence run needed for the speech-to-silence transition (ms)
    pub min_silence_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.45,
            window_ms: 30,
            min_speech_ms: 100,
            min_silence_ms: 300,
        }
    }
}

impl VadConfig {
    pub fn from_settings(settings: &confab_config::VadSettings) -> Self {
        Self {
            activation_threshold: settings.activation_threshold,
            min_speech_ms: settings.min_speech_ms,
            min_silence_ms: settings.min_silence_ms,
            ..Self::default()
        }
    }
}

/// Speech boundary event.
///
/// Continuation emits no event; continuing speech only keeps samples flowing
/// to STT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart {
        participant: ParticipantId,
        at_ms: u64,
    },
    SpeechEnd {
        participant: ParticipantId,
        at_ms: u64,
    },
}

/// Window scorer, pluggable for model-based classifiers.
pub trait VadScorer: Send {
    /// Speech likelihood of one window, 0.0 - 1.0.
    fn score(&mut self, window: &[i16]) -> f32;
}

/// Default scorer: short-term RMS energy mapped onto [0, 1].
///
/// -60 dBFS and below scores 0, -20 dBFS and above scores 1.
pub struct EnergyScorer {
    floor_db: f32,
    ceil_db: f32,
}

impl EnergyScorer {
    pub fn new() -> Self {
        Self {
            floor_db: -60.0,
            ceil_db: -20.0,
        }
    }
}

impl Default for EnergyScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl VadScorer for EnergyScorer {
    fn score(&mut self, window: &[i16]) -> f32 {
        if window.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = window.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = (sum_sq / window.len() as f64).sqrt();
        if rms < 1.0 {
            return 0.0;
        }
        let db = 20.0 * (rms / i16::MAX as f64).log10() as f32;
        ((db - self.floor_db) / (self.ceil_db - self.floor_db)).clamp(0.0, 1.0)
    }
}

/// Per-participant voice activity detector.
pub struct VoiceActivityDetector {
    config: VadConfig,
    scorer: Box<dyn VadScorer>,
    participant: ParticipantId,
    window: Vec<i16>,
    window_samples: usize,
    in_speech: bool,
    speech_run_ms: u64,
    silence_run_ms: u64,
    /// Capture timestamp of the end of the last classified window
    clock_ms: u64,
}

impl VoiceActivityDetector {
    pub fn new(participant: ParticipantId, config: VadConfig, scorer: Box<dyn VadScorer>) -> Self {
        let window_samples =
            (confab_core::PIPELINE_SAMPLE_RATE_HZ as u64 * config.window_ms / 1000) as usize;
        Self {
            config,
            scorer,
            participant,
            window: Vec::with_capacity(window_samples),
            window_samples,
            in_speech: false,
            speech_run_ms: 0,
            silence_run_ms: 0,
            clock_ms: 0,
        }
    }

    pub fn with_energy_scorer(participant: ParticipantId, config: VadConfig) -> Self {
        Self::new(participant, config, Box::new(EnergyScorer::new()))
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Feed one frame; returns boundary events detected within it.
    pub fn push_frame(&mut self, frame: &AudioFrame) -> Vec<VadEvent> {
        // Frame timestamps come from capture; windows are stamped by where
        // they end inside the accumulated stream.
        if self.window.is_empty() {
            self.clock_ms = frame.capture_ts_ms;
        }

        let mut events = Vec::new();
        for &sample in &frame.pcm {
            self.window.push(sample);
            if self.window.len() == self.window_samples {
                self.clock_ms += self.config.window_ms;
                let score = self.scorer.score(&self.window);
                self.window.clear();
                if let Some(event) = self.classify(score) {
                    events.push(event);
                }
            }
        }
        events
    }

    fn classify(&mut self, score: f32) -> Option<VadEvent> {
        if score >= self.config.activation_threshold {
            self.speech_run_ms += self.config.window_ms;
            self.silence_run_ms = 0;
        } else {
            self.silence_run_ms += self.config.window_ms;
            self.speech_run_ms = 0;
        }

        if !self.in_speech && self.speech_run_ms >= self.config.min_speech_ms {
            self.in_speech = true;
            return Some(VadEvent::SpeechStart {
                participant: self.participant.clone(),
                at_ms: self.clock_ms.saturating_sub(self.speech_run_ms),
            });
        }
        if self.in_speech && self.silence_run_ms >= self.config.min_silence_ms {
            self.in_speech = false;
            return Some(VadEvent::SpeechEnd {
                participant: self.participant.clone(),
                at_ms: self.clock_ms.saturating_sub(self.silence_run_ms),
            });
        }
        None
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.in_speech = false;
        self.speech_run_ms = 0;
        self.silence_run_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::PIPELINE_SAMPLE_RATE_HZ;

    fn frame(participant: &str, pcm: Vec<i16>, ts: u64) -> AudioFrame {
        AudioFrame::new(ParticipantId::from(participant), pcm, PIPELINE_SAMPLE_RATE_HZ, ts)
    }

    fn loud(ms: u64) -> Vec<i16> {
        let samples = (PIPELINE_SAMPLE_RATE_HZ as u64 * ms / 1000) as usize;
        (0..samples)
            .map(|i| ((i as f32 * 0.6).sin() * 8000.0) as i16)
            .collect()
    }

    fn quiet(ms: u64) -> Vec<i16> {
        let samples = (PIPELINE_SAMPLE_RATE_HZ as u64 * ms / 1000) as usize;
        vec![0i16; samples]
    }

    #[test]
    fn test_energy_scorer_extremes() {
        let mut scorer = EnergyScorer::new();
        assert_eq!(scorer.score(&quiet(30)), 0.0);
        assert!(scorer.score(&loud(30)) > 0.9);
    }

    #[test]
    fn test_speech_start_after_min_run() {
        let mut vad =
            VoiceActivityDetector::with_energy_scorer(ParticipantId::from("alice"), VadConfig::default());

        // 90ms of speech: below the 100ms activation run
        let events = vad.push_frame(&frame("alice", loud(90), 0));
        assert!(events.is_empty());
        assert!(!vad.in_speech());

        // 30ms more crosses it
        let events = vad.push_frame(&frame("alice", loud(30), 90));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], VadEvent::SpeechStart { .. }));
        assert!(vad.in_speech());
    }

    #[test]
    fn test_speech_end_after_min_silence() {
        let mut vad =
            VoiceActivityDetector::with_energy_scorer(ParticipantId::from("alice"), VadConfig::default());

        vad.push_frame(&frame("alice", loud(150), 0));
        assert!(vad.in_speech());

        // 270ms silence: not yet
        let events = vad.push_frame(&frame("alice", quiet(270), 150));
        assert!(events.is_empty());

        // 30ms more ends speech
        let events = vad.push_frame(&frame("alice", quiet(30), 420));
        assert_eq!(events.len(), 1);
        match &events[0] {
            VadEvent::SpeechEnd { at_ms, .. } => {
                // Backdated to where silence began
                assert_eq!(*at_ms, 150);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!vad.in_speech());
    }

    #[test]
    fn test_short_blip_emits_nothing() {
        let mut vad =
            VoiceActivityDetector::with_energy_scorer(ParticipantId::from("alice"), VadConfig::default());

        // 60ms blip then silence never reaches min_speech
        let mut events = vad.push_frame(&frame("alice", loud(60), 0));
        events.extend(vad.push_frame(&frame("alice", quiet(600), 60)));
        assert!(events.is_empty());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut vad =
            VoiceActivityDetector::with_energy_scorer(ParticipantId::from("alice"), VadConfig::default());
        vad.push_frame(&frame("alice", loud(150), 0));
        assert!(vad.in_speech());
        vad.reset();
        assert!(!vad.in_speech());
    }
}
