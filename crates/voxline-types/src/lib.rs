//! Shared types for the voxline call pipeline.
//!
//! This crate provides the domain types used across all voxline crates:
//! conversation turns, call states, audio frames and agent profiles.
//! It performs no I/O so that every other crate can depend on it without
//! pulling in a runtime.

pub mod audio;
pub mod profile;

pub use audio::{AudioCodec, AudioFrame, MediaFormat};
pub use profile::AgentProfile;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who contributed a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// The person on the phone.
    Caller,
    /// The AI agent.
    Agent,
}

impl TurnRole {
    /// Returns the chat-completion role name for this participant.
    pub fn chat_role(self) -> &'static str {
        match self {
            Self::Caller => "user",
            Self::Agent => "assistant",
        }
    }
}

/// One complete contribution to the conversation transcript.
///
/// Turns are appended once a role's contribution completes and are never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub at: DateTime<Utc>,
    /// `false` when the agent reply was generated but synthesis failed, so the
    /// caller never heard it. Always `true` for caller turns.
    pub spoken: bool,
}

impl ConversationTurn {
    pub fn caller(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Caller,
            text: text.into(),
            at: Utc::now(),
            spoken: true,
        }
    }

    pub fn agent(text: impl Into<String>, spoken: bool) -> Self {
        Self {
            role: TurnRole::Agent,
            text: text.into(),
            at: Utc::now(),
            spoken,
        }
    }
}

/// Conversation state of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Session allocated, `start` not yet processed.
    #[default]
    Idle,
    /// Accumulating caller audio, waiting for end of speech.
    Listening,
    /// Caller utterance finalized; recognition and generation in flight.
    Thinking,
    /// Agent reply is being synthesized and streamed to the caller.
    Speaking,
    /// Terminal.
    Ended,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Ended => "ended",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Ended
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
