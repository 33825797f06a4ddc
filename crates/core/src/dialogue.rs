//! Rolling dialogue context
//!
//! Bounded window of prior turns with the system preamble pinned. The only
//! writers are the turn controller (user turns, at commit) and the response
//! generator (assistant turns); readers take a snapshot copy under a mutex
//! with bounded critical sections.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Speaker role of a dialogue turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One committed turn of the conversation.
#[derive(Debug, Clone)]
pub struct DialogueTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Assistant turn cut short by barge-in
    pub truncated: bool,
    /// Assistant turn that stands in for a generation failure
    pub failed: bool,
}

impl DialogueTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            truncated: false,
            failed: false,
        }
    }

    pub fn truncated(role: Role, text: impl Into<String>) -> Self {
        Self {
            truncated: true,
            ..Self::new(role, text)
        }
    }

    pub fn failure_marker(text: impl Into<String>) -> Self {
        Self {
            failed: true,
            ..Self::new(Role::Assistant, text)
        }
    }
}

/// Bounded rolling window of dialogue turns.
pub struct DialogueContext {
    preamble: Option<DialogueTurn>,
    turns: VecDeque<DialogueTurn>,
    max_turns: usize,
    max_chars: usize,
}

impl DialogueContext {
    pub fn new(system_preamble: Option<&str>, max_turns: usize, max_chars: usize) -> Self {
        let preamble = system_preamble
            .filter(|p| !p.trim().is_empty())
            .map(|p| DialogueTurn::new(Role::System, p));
        Self {
            preamble,
            turns: VecDeque::new(),
            max_turns,
            max_chars,
        }
    }

    /// Append a turn, then trim oldest non-system turns back under budget.
    pub fn push(&mut self, turn: DialogueTurn) {
        debug_assert!(turn.role != Role::System, "preamble is set at construction");
        self.turns.push_back(turn);
        self.trim();
    }

    fn trim(&mut self) {
        while self.turns.len() > self.max_turns
            || (self.char_len() > self.max_chars && self.turns.len() > 1)
        {
            self.turns.pop_front();
        }
    }

    /// Total characters across preamble and turns.
    pub fn char_len(&self) -> usize {
        let preamble_len = self.preamble.as_ref().map_or(0, |p| p.text.len());
        preamble_len + self.turns.iter().map(|t| t.text.len()).sum::<usize>()
    }

    /// Number of non-system turns.
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Snapshot copy, preamble first.
    pub fn snapshot(&self) -> Vec<DialogueTurn> {
        let mut out = Vec::with_capacity(self.turns.len() + 1);
        if let Some(ref preamble) = self.preamble {
            out.push(preamble.clone());
        }
        out.extend(self.turns.iter().cloned());
        out
    }

    pub fn preamble(&self) -> Option<&DialogueTurn> {
        self.preamble.as_ref()
    }

    /// Most recent turn, excluding the preamble.
    pub fn last(&self) -> Option<&DialogueTurn> {
        self.turns.back()
    }
}

/// Shared handle over the dialogue context.
///
/// Snapshot-on-read keeps the critical section to a copy.
#[derive(Clone)]
pub struct SharedDialogue {
    inner: Arc<Mutex<DialogueContext>>,
}

impl SharedDialogue {
    pub fn new(system_preamble: Option<&str>, max_turns: usize, max_chars: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DialogueContext::new(
                system_preamble,
                max_turns,
                max_chars,
            ))),
        }
    }

    pub fn push_user(&self, text: impl Into<String>) {
        self.inner.lock().push(DialogueTurn::new(Role::User, text));
    }

    pub fn push_assistant(&self, turn: DialogueTurn) {
        self.inner.lock().push(turn);
    }

    pub fn snapshot(&self) -> Vec<DialogueTurn> {
        self.inner.lock().snapshot()
    }

    pub fn char_len(&self) -> usize {
        self.inner.lock().char_len()
    }

    pub fn turn_count(&self) -> usize {
        self.inner.lock().turn_count()
    }
}
