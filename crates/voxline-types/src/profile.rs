//! Agent profile definitions.
//!
//! An `AgentProfile` describes how the AI agent on a call behaves: the voice it
//! speaks with, its system prompt, sampling temperature, how long the caller
//! must stay silent before a turn is considered complete, and the prompt used
//! to summarize the call afterwards. Profiles are read-only to the pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_id() -> String {
    "default".to_string()
}

fn default_name() -> String {
    "Default Agent".to_string()
}

fn default_voice() -> String {
    "en-US-Neural2-F".to_string()
}

fn default_prompt() -> String {
    "You are a helpful AI assistant. Answer the user's questions concisely and professionally."
        .to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_end_of_speech_timeout_ms() -> u64 {
    1000
}

fn default_post_prompt() -> String {
    "Summarize the conversation.".to_string()
}

/// Agent behaviour for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique identifier used to select the profile for a call.
    #[serde(default = "default_id")]
    pub id: String,
    /// Human-readable name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Voice identifier passed to the synthesis capability.
    #[serde(default = "default_voice")]
    pub voice: String,
    /// System prompt sent with every generation request.
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Caller silence after which the utterance is considered complete.
    #[serde(default = "default_end_of_speech_timeout_ms")]
    pub end_of_speech_timeout_ms: u64,
    /// Prompt used to summarize the call once it ends. Empty disables the summary.
    #[serde(default = "default_post_prompt")]
    pub post_prompt: String,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            id: default_id(),
            name: default_name(),
            voice: default_voice(),
            prompt: default_prompt(),
            temperature: default_temperature(),
            end_of_speech_timeout_ms: default_end_of_speech_timeout_ms(),
            post_prompt: default_post_prompt(),
        }
    }
}

impl AgentProfile {
    pub fn end_of_speech_timeout(&self) -> Duration {
        Duration::from_millis(self.end_of_speech_timeout_ms)
    }

    pub fn wants_summary(&self) -> bool {
        !self.post_prompt.trim().is_empty()
    }
}
