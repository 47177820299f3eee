//! Voice capabilities for the voxline call pipeline.
//!
//! Provides the three external capabilities a call depends on: streaming
//! reply generation ([`LlmClient`]), speech synthesis paced into outbound
//! frames ([`TtsStreamer`] over a [`Synthesizer`]) and utterance
//! transcription ([`Transcriber`]). Each capability is a trait so the
//! pipeline can run against in-process fakes; the `Http*` types talk to
//! OpenAI-compatible endpoints.
//!
//! The [`codec`] module holds the G.711 and linear PCM conversions shared by
//! synthesis, recognition and voice-activity detection.

pub mod codec;
pub mod config;
pub mod error;
pub mod llm;
pub mod stt;
pub mod tts;

pub use config::{LlmConfig, SttConfig, TtsConfig};
pub use error::VoiceError;
pub use llm::{
    summarize, ChatMessage, GenerationRequest, HttpLlmClient, LlmClient, TokenStream,
    FALLBACK_UTTERANCE, SUMMARY_FAILED,
};
pub use stt::{HttpTranscriber, Transcriber};
pub use tts::{FrameStream, HttpSynthesizer, PhraseBuffer, Synthesizer, TtsStreamer};
