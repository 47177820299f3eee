use crate::codec;
use crate::config::SttConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use voxline_types::MediaFormat;

/// Maximum audio input size for STT (10 MiB). Prevents OOM from oversized payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for a single transcription request.
const STT_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribes one caller utterance encoded in `format`.
    async fn transcribe(&self, audio: &[u8], format: MediaFormat) -> Result<String, VoiceError>;
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcriber for OpenAI-compatible `/audio/transcriptions` endpoints.
#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    config: SttConfig,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(config: SttConfig) -> Result<Self, VoiceError> {
        if config.base_url.trim().is_empty() {
            return Err(VoiceError::Config("stt.base_url must not be empty".to_string()));
        }
        let client = reqwest::Client::builder().timeout(STT_TIMEOUT).build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &[u8], format: MediaFormat) -> Result<String, VoiceError> {
        if audio.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                audio.len(),
                MAX_STT_INPUT_BYTES
            )));
        }
        if audio.is_empty() {
            return Ok(String::new());
        }

        let samples = codec::decode(audio, format.codec);
        let wav = codec::pcm16_to_wav(&samples, format.sample_rate);
        debug!(bytes = wav.len(), "uploading utterance for transcription");

        let file = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(format!("invalid upload part: {}", e)))?;
        let form = Form::new()
            .part("file", file)
            .text("model", self.config.model.clone());

        let url = format!(
            "{}/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(format!("transcription request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!(
                "transcription API error {}: {}",
                status, body
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Stt(format!("invalid transcription response: {}", e)))?;
        Ok(parsed.text.trim().to_string())
    }
}
