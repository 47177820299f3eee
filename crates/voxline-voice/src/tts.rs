//! Streaming speech synthesis.
//!
//! [`TtsStreamer`] turns a [`TokenStream`] into paced outbound audio. Tokens
//! are grouped into phrases, each phrase is synthesized as soon as it is
//! complete, and the resulting audio is sliced into fixed-duration frames in
//! the call's codec. Frames are released no faster than real time: a far end
//! that receives audio ahead of playback produces artifacts.

use crate::codec;
use crate::config::TtsConfig;
use crate::error::VoiceError;
use crate::llm::TokenStream;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use voxline_types::{AudioFrame, MediaFormat};

/// Maximum text input size for a single synthesis request (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Frames buffered ahead of the pacer (one second at 20 ms frames).
const FRAME_BUFFER: usize = 50;

/// Clause punctuation only ends a phrase once the phrase is this long.
const MIN_CLAUSE_CHARS: usize = 24;

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesizes `text` to mono 16-bit PCM at `sample_rate`.
    async fn synthesize(&self, text: &str, voice: &str, sample_rate: u32) -> Result<Vec<i16>, VoiceError>;
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    sample_rate: u32,
}

/// Synthesizer for OpenAI-compatible `/audio/speech` endpoints returning raw PCM.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    config: TtsConfig,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(config: TtsConfig) -> Result<Self, VoiceError> {
        if config.base_url.trim().is_empty() {
            return Err(VoiceError::Config("tts.base_url must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str, sample_rate: u32) -> Result<Vec<i16>, VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }

        let url = format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&SpeechRequest {
                model: &self.config.model,
                input: text,
                voice,
                response_format: "pcm",
                sample_rate,
            })
            .send()
            .await
            .map_err(|e| VoiceError::Tts(format!("speech request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("speech API error {}: {}", status, body)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(format!("failed to read speech body: {}", e)))?;
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Groups streamed tokens into phrases worth synthesizing on their own.
///
/// A phrase ends at sentence punctuation followed by whitespace, at a
/// newline, or at clause punctuation once it has grown past a minimum length.
#[derive(Debug, Default)]
pub struct PhraseBuffer {
    pending: String,
}

impl PhraseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.pending.push_str(token);
        let mut phrases = Vec::new();
        while let Some(end) = self.boundary() {
            let rest = self.pending.split_off(end);
            let phrase = std::mem::replace(&mut self.pending, rest);
            let phrase = phrase.trim();
            if !phrase.is_empty() {
                phrases.push(phrase.to_string());
            }
        }
        phrases
    }

    /// Returns whatever text is left once the token stream ends.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    fn boundary(&self) -> Option<usize> {
        let mut chars = self.pending.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            let end = idx + c.len_utf8();
            if c == '\n' {
                return Some(end);
            }
            let terminal = matches!(c, '.' | '!' | '?');
            let clause = matches!(c, ',' | ';' | ':') && end >= MIN_CLAUSE_CHARS;
            if terminal || clause {
                match chars.peek() {
                    Some((_, next)) if next.is_whitespace() => return Some(end),
                    _ => {}
                }
            }
        }
        None
    }
}

/// Paced sequence of synthesized frames for one reply.
///
/// Dropping the stream discards every frame not yet taken from it.
pub struct FrameStream {
    rx: mpsc::Receiver<Result<AudioFrame, VoiceError>>,
    pacer: Interval,
    cancel: CancellationToken,
}

impl FrameStream {
    /// Waits for the next frame, no earlier than one frame interval after the
    /// previous one. Returns `None` when synthesis is finished or cancelled.
    pub async fn next_frame(&mut self) -> Option<Result<AudioFrame, VoiceError>> {
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            item = self.rx.recv() => item?,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = self.pacer.tick() => Some(item),
        }
    }
}

/// Converts token streams into paced audio frames.
#[derive(Clone)]
pub struct TtsStreamer {
    synthesizer: Arc<dyn Synthesizer>,
    frame_duration: Duration,
}

impl TtsStreamer {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, frame_duration: Duration) -> Self {
        Self {
            synthesizer,
            frame_duration: frame_duration.max(Duration::from_millis(1)),
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Starts synthesizing `tokens` with `voice` in the call's `format`.
    ///
    /// The returned stream ends after the last frame, after the first
    /// synthesis error (yielded as `Err`), or as soon as `cancel` fires.
    pub fn synthesize(
        &self,
        tokens: TokenStream,
        voice: &str,
        format: MediaFormat,
        cancel: CancellationToken,
    ) -> FrameStream {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let mut pacer = tokio::time::interval(self.frame_duration);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let worker = SynthesisWorker {
            synthesizer: self.synthesizer.clone(),
            voice: voice.to_string(),
            format,
            frame_len: format.frame_len(self.frame_duration).max(1),
            cancel: cancel.clone(),
            tx,
            pending: Vec::new(),
            sequence: 0,
        };
        tokio::spawn(worker.run(tokens));

        FrameStream { rx, pacer, cancel }
    }
}

struct SynthesisWorker {
    synthesizer: Arc<dyn Synthesizer>,
    voice: String,
    format: MediaFormat,
    frame_len: usize,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<AudioFrame, VoiceError>>,
    /// Encoded audio shorter than one frame, carried into the next phrase.
    pending: Vec<u8>,
    sequence: u64,
}

impl SynthesisWorker {
    async fn run(mut self, mut tokens: TokenStream) {
        let mut phrases = PhraseBuffer::new();
        loop {
            let token = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                token = tokens.next_token() => token,
            };
            match token {
                Some(token) => {
                    for phrase in phrases.push(&token) {
                        if !self.speak(&phrase).await {
                            return;
                        }
                    }
                }
                None => {
                    if let Some(rest) = phrases.flush() {
                        if !self.speak(&rest).await {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        self.flush_tail().await;
    }

    /// Synthesizes one phrase and queues its full frames. Returns `false` when
    /// the worker should stop.
    async fn speak(&mut self, phrase: &str) -> bool {
        debug!(chars = phrase.len(), "synthesizing phrase");
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            result = self.synthesizer.synthesize(phrase, &self.voice, self.format.sample_rate) => result,
        };
        let samples = match result {
            Ok(samples) => samples,
            Err(e) => {
                warn!("phrase synthesis failed: {}", e);
                let _ = self.tx.send(Err(e)).await;
                return false;
            }
        };

        self.pending.extend(codec::encode(&samples, self.format.codec));
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let payload = std::mem::replace(&mut self.pending, rest);
            if !self.emit(payload).await {
                return false;
            }
        }
        true
    }

    /// Pads the trailing partial frame with silence and queues it.
    async fn flush_tail(&mut self) {
        if self.pending.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        let mut payload = std::mem::take(&mut self.pending);
        payload.resize(self.frame_len, codec::silence_byte(self.format.codec));
        self.emit(payload).await;
    }

    async fn emit(&mut self, payload: Vec<u8>) -> bool {
        let frame = AudioFrame::new(payload, self.format, self.sequence);
        self.sequence += 1;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(frame)) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use voxline_types::AudioCodec;

    /// Returns a fixed number of loud samples per phrase and records the phrases.
    struct FixedSynth {
        samples_per_phrase: usize,
        phrases: Mutex<Vec<String>>,
    }

    impl FixedSynth {
        fn new(samples_per_phrase: usize) -> Arc<Self> {
            Arc::new(Self {
                samples_per_phrase,
                phrases: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Synthesizer for FixedSynth {
        async fn synthesize(&self, text: &str, _voice: &str, _rate: u32) -> Result<Vec<i16>, VoiceError> {
            self.phrases.lock().unwrap().push(text.to_string());
            Ok(vec![8000; self.samples_per_phrase])
        }
    }

    struct FailingSynth;

    #[async_trait]
    impl Synthesizer for FailingSynth {
        async fn synthesize(&self, _text: &str, _voice: &str, _rate: u32) -> Result<Vec<i16>, VoiceError> {
            Err(VoiceError::Tts("voice unavailable".to_string()))
        }
    }

    #[test]
    fn phrase_buffer_splits_on_sentence_end() {
        let mut buffer = PhraseBuffer::new();
        assert!(buffer.push("Hello there").is_empty());
        // The period is only a boundary once the following whitespace arrives.
        assert!(buffer.push(".").is_empty());
        assert_eq!(buffer.push(" How"), vec!["Hello there.".to_string()]);
        assert!(buffer.push(" are you").is_empty());
        assert_eq!(buffer.flush(), Some("How are you".to_string()));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn phrase_buffer_keeps_decimals_and_short_clauses_together() {
        let mut buffer = PhraseBuffer::new();
        assert!(buffer.push("It costs 3.50, ok").is_empty());
        let phrases = buffer.push(" so it is a bargain, honestly\nYes");
        assert_eq!(
            phrases,
            vec![
                "It costs 3.50, ok so it is a bargain,".to_string(),
                "honestly".to_string()
            ]
        );
        assert_eq!(buffer.flush(), Some("Yes".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_paced_to_frame_duration() {
        let synth = FixedSynth::new(320); // 40 ms at 8 kHz
        let streamer = TtsStreamer::new(synth.clone(), Duration::from_millis(20));
        let tokens = TokenStream::from_tokens(["Hello", " there"]);
        let mut frames = streamer.synthesize(
            tokens,
            "alloy",
            MediaFormat::default(),
            CancellationToken::new(),
        );

        let first = frames.next_frame().await.unwrap().unwrap();
        let first_at = Instant::now();
        let second = frames.next_frame().await.unwrap().unwrap();
        assert!(Instant::now() - first_at >= Duration::from_millis(20));
        assert!(frames.next_frame().await.is_none());

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.payload.len(), 160);
        assert_eq!(first.codec, AudioCodec::Pcmu);
        assert_eq!(*synth.phrases.lock().unwrap(), vec!["Hello there".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_partial_frame_is_padded_with_silence() {
        let streamer = TtsStreamer::new(FixedSynth::new(200), Duration::from_millis(20));
        let mut frames = streamer.synthesize(
            TokenStream::from_tokens(["Hi"]),
            "alloy",
            MediaFormat::default(),
            CancellationToken::new(),
        );
        let _full = frames.next_frame().await.unwrap().unwrap();
        let tail = frames.next_frame().await.unwrap().unwrap();
        assert_eq!(tail.payload.len(), 160);
        assert_eq!(tail.payload[40..], [0xFF; 120]);
        assert!(frames.next_frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_buffered_frames() {
        let streamer = TtsStreamer::new(FixedSynth::new(8000), Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let mut frames = streamer.synthesize(
            TokenStream::from_tokens(["A long reply"]),
            "alloy",
            MediaFormat::default(),
            cancel.clone(),
        );

        assert!(frames.next_frame().await.is_some());
        assert!(frames.next_frame().await.is_some());
        cancel.cancel();
        assert!(frames.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn synthesis_failure_is_yielded_once() {
        let streamer = TtsStreamer::new(Arc::new(FailingSynth), Duration::from_millis(20));
        let mut frames = streamer.synthesize(
            TokenStream::from_tokens(["Hello."]),
            "alloy",
            MediaFormat::default(),
            CancellationToken::new(),
        );
        match frames.next_frame().await {
            Some(Err(VoiceError::Tts(msg))) => assert!(msg.contains("voice unavailable")),
            other => panic!("expected synthesis error, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(frames.next_frame().await.is_none());
    }
}
