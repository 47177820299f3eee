use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

fn default_llm_base_url() -> String {
    "https://api.telnyx.com/v2/ai".to_string()
}

fn default_llm_model() -> String {
    "meta-llama/Meta-Llama-3-70B-Instruct".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    256
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_frame_ms() -> u64 {
    20
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

/// Streaming chat-completion endpoint settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Upper bound on a whole generation request, body streaming included.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Speech synthesis endpoint settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    /// Duration of one outbound audio frame in milliseconds.
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            api_key: String::new(),
            model: default_tts_model(),
            frame_ms: default_frame_ms(),
        }
    }
}

impl fmt::Debug for TtsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtsConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("frame_ms", &self.frame_ms)
            .finish()
    }
}

impl TtsConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }
}

/// Speech recognition endpoint settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            api_key: String::new(),
            model: default_stt_model(),
        }
    }
}

impl fmt::Debug for SttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SttConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}
