//! Session supervision for the confab voice agent
//!
//! One session per room. The supervisor owns every task the session
//! spawns, propagates the root cancellation signal, drains gracefully when
//! the room empties, and fans telemetry out to the room's data channels
//! and to local subscribers.

mod session;
mod supervisor;

pub use session::{Session, SessionHandle};
pub use supervisor::Supervisor;

use thiserror::Error;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("configuration rejected: {0}")]
    Config(#[from] confab_config::ConfigError),

    /// An engine endpoint failed its startup probe; the session does not
    /// start and does not rejoin.
    #[error("startup probe failed: {0}")]
    Startup(String),

    #[error("session error: {0}")]
    Session(String),
}

impl From<AgentError> for confab_core::Error {
    fn from(err: AgentError) -> Self {
        confab_core::Error::Session(err.to_string())
    }
}
