//! Configuration for the confab voice agent
//!
//! The core takes a fully-built [`Settings`] record at session construction;
//! the external launcher decides where it comes from. [`load_settings`]
//! provides the standard file + environment layering for launchers that want
//! it.

mod settings;

pub use settings::{
    load_settings, DialogueSettings, LlmSettings, PublishSettings, Settings, SttSettings,
    TimeoutSettings, TtsSettings, TurnSettings, VadSettings,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),
}
