//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Full configuration record for one agent session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Speech recognition
    #[serde(default)]
    pub stt: SttSettings,

    /// Language model
    #[serde(default)]
    pub llm: LlmSettings,

    /// Speech synthesis
    #[serde(default)]
    pub tts: TtsSettings,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadSettings,

    /// Turn taking
    #[serde(default)]
    pub turn: TurnSettings,

    /// Dialogue context bounds
    #[serde(default)]
    pub dialogue: DialogueSettings,

    /// Outbound audio
    #[serde(default)]
    pub publish: PublishSettings,

    /// Stage timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl Settings {
    /// Validate settings. Startup fails fatally on error; the supervisor
    /// does not attempt to rejoin with a bad record.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stt.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "stt.url".to_string(),
                message: "STT endpoint is required".to_string(),
            });
        }
        if self.llm.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "llm.url".to_string(),
                message: "LLM endpoint is required".to_string(),
            });
        }
        if self.tts.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tts.url".to_string(),
                message: "TTS endpoint is required".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.vad.activation_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "vad.activation_threshold".to_string(),
                message: "threshold must be in [0, 1]".to_string(),
            });
        }
        if self.publish.sample_rate_hz == 0 || self.tts.sample_rate_hz == 0 {
            return Err(ConfigError::InvalidValue {
                field: "publish.sample_rate_hz".to_string(),
                message: "sample rates must be nonzero".to_string(),
            });
        }
        if self.dialogue.max_turns == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dialogue.max_turns".to_string(),
                message: "dialogue window must hold at least one turn".to_string(),
            });
        }
        if self.turn.barge_in_deadline_ms < 50 {
            return Err(ConfigError::InvalidValue {
                field: "turn.barge_in_deadline_ms".to_string(),
                message: "barge-in deadline below 50ms is not schedulable".to_string(),
            });
        }
        Ok(())
    }
}

/// Speech recognition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSettings {
    /// WebSocket endpoint, e.g. ws://whisperlive:9090
    #[serde(default = "default_stt_url")]
    pub url: String,

    /// Language code sent in the handshake
    #[serde(default = "default_stt_language")]
    pub language: String,

    /// Model tier sent in the handshake
    #[serde(default = "default_stt_model")]
    pub model: String,
}

fn default_stt_url() -> String {
    "ws://whisperlive:9090".to_string()
}
fn default_stt_language() -> String {
    "en".to_string()
}
fn default_stt_model() -> String {
    "small".to_string()
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            url: default_stt_url(),
            language: default_stt_language(),
            model: default_stt_model(),
        }
    }
}

/// Language model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Chat endpoint base URL, e.g. http://ollama:11434
    #[serde(default = "default_llm_url")]
    pub url: String,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
}

fn default_llm_url() -> String {
    "http://ollama:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3.1".to_string()
}
fn default_llm_temperature() -> f32 {
    0.7
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            model: default_llm_model(),
            temperature: default_llm_temperature(),
        }
    }
}

/// Speech synthesis settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    /// Synthesis endpoint base URL
    #[serde(default = "default_tts_url")]
    pub url: String,

    /// Voice model name
    #[serde(default = "default_tts_voice")]
    pub voice: String,

    /// Sample rate requested from the synthesizer
    #[serde(default = "default_tts_sample_rate")]
    pub sample_rate_hz: u32,
}

fn default_tts_url() -> String {
    "http://piper-tts:5500".to_string()
}
fn default_tts_voice() -> String {
    "en_US-lessac-medium".to_string()
}
fn default_tts_sample_rate() -> u32 {
    22_050
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            voice: default_tts_voice(),
            sample_rate_hz: default_tts_sample_rate(),
        }
    }
}

/// Voice activity detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Speech score threshold (0.0 - 1.0)
    #[serde(default = "default_vad_threshold")]
    pub activation_threshold: f32,

    /// Minimum speech run to confirm speech (ms)
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,

    /// Minimum silence run to end speech (ms)
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u64,
}

fn default_vad_threshold() -> f32 {
    0.45
}
fn default_min_speech_ms() -> u64 {
    100
}
fn default_min_silence_ms() -> u64 {
    300
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            activation_threshold: default_vad_threshold(),
            min_speech_ms: default_min_speech_ms(),
            min_silence_ms: default_min_silence_ms(),
        }
    }
}

/// Turn-taking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSettings {
    /// Endpointing timer: silence after SpeechEnd before forced commit (ms)
    #[serde(default = "default_endpointing_delay_ms")]
    pub endpointing_delay_ms: u64,

    /// Audio keeps flowing to STT this long after SpeechEnd (ms)
    #[serde(default = "default_stt_hangover_ms")]
    pub stt_hangover_ms: u64,

    /// Outbound audio must stop within this after barge-in (ms)
    #[serde(default = "default_barge_in_deadline_ms")]
    pub barge_in_deadline_ms: u64,

    /// Minimum accrued silence before the early-commit predicate may fire (ms)
    #[serde(default = "default_min_commit_silence_ms")]
    pub min_commit_silence_ms: u64,

    /// Tokens that mark a transcript as complete, besides sentence punctuation
    #[serde(default)]
    pub completion_tokens: Vec<String>,
}

fn default_endpointing_delay_ms() -> u64 {
    2000
}
fn default_stt_hangover_ms() -> u64 {
    300
}
fn default_barge_in_deadline_ms() -> u64 {
    150
}
fn default_min_commit_silence_ms() -> u64 {
    300
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            endpointing_delay_ms: default_endpointing_delay_ms(),
            stt_hangover_ms: default_stt_hangover_ms(),
            barge_in_deadline_ms: default_barge_in_deadline_ms(),
            min_commit_silence_ms: default_min_commit_silence_ms(),
            completion_tokens: Vec::new(),
        }
    }
}

/// Dialogue context settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueSettings {
    /// Maximum turns retained outside the preamble
    #[serde(default = "default_dialogue_max_turns")]
    pub max_turns: usize,

    /// Maximum characters across the whole context
    #[serde(default = "default_dialogue_max_chars")]
    pub max_chars: usize,

    /// System preamble pinned at the head of every request
    #[serde(default = "default_system_preamble")]
    pub system_preamble: String,

    /// Spoken once when the session starts, before listening begins
    #[serde(default)]
    pub greeting: Option<String>,
}

fn default_dialogue_max_turns() -> usize {
    16
}
fn default_dialogue_max_chars() -> usize {
    4096
}
fn default_system_preamble() -> String {
    "You are a helpful voice assistant. Keep your responses concise and \
     natural for spoken conversation."
        .to_string()
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self {
            max_turns: default_dialogue_max_turns(),
            max_chars: default_dialogue_max_chars(),
            system_preamble: default_system_preamble(),
            greeting: None,
        }
    }
}

/// Outbound audio settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    /// Sample rate of frames handed to the media transport
    #[serde(default = "default_publish_sample_rate")]
    pub sample_rate_hz: u32,
}

fn default_publish_sample_rate() -> u32 {
    48_000
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            sample_rate_hz: default_publish_sample_rate(),
        }
    }
}

/// Stage timeouts, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_stt_handshake_ms")]
    pub stt_handshake_ms: u64,

    #[serde(default = "default_llm_first_token_ms")]
    pub llm_first_token_ms: u64,

    #[serde(default = "default_llm_total_ms")]
    pub llm_total_ms: u64,

    #[serde(default = "default_tts_first_byte_ms")]
    pub tts_first_byte_ms: u64,

    /// Graceful drain after the last participant leaves
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
}

fn default_stt_handshake_ms() -> u64 {
    3000
}
fn default_llm_first_token_ms() -> u64 {
    5000
}
fn default_llm_total_ms() -> u64 {
    20_000
}
fn default_tts_first_byte_ms() -> u64 {
    2000
}
fn default_drain_ms() -> u64 {
    3000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            stt_handshake_ms: default_stt_handshake_ms(),
            llm_first_token_ms: default_llm_first_token_ms(),
            llm_total_ms: default_llm_total_ms(),
            tts_first_byte_ms: default_tts_first_byte_ms(),
            drain_ms: default_drain_ms(),
        }
    }
}

/// Load settings from files and environment.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`CONFAB__` prefix, `__` separator)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder = builder.add_source(File::with_name(&format!("config/{env_name}")).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("CONFAB")
            .separator("__")
            .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.vad.activation_threshold, 0.45);
        assert_eq!(settings.turn.endpointing_delay_ms, 2000);
        assert_eq!(settings.publish.sample_rate_hz, 48_000);
    }

    #[test]
    fn test_validation_rejects_empty_endpoint() {
        let mut settings = Settings::default();
        settings.stt.url.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let mut settings = Settings::default();
        settings.vad.activation_threshold = 1.5;
        assert!(settings.validate().is_err());
    }
}
