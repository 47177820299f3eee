//! In-process fakes for the voice capabilities, shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use voxline_server::config::PipelineConfig;
use voxline_server::orchestrator::{OutboundFrame, Pipeline, StateChange};
use voxline_server::protocol::StartEvent;
use voxline_server::registry::CallRegistry;
use voxline_server::stats::StatsAggregator;
use voxline_types::{AgentProfile, AudioFrame, CallState, MediaFormat};
use voxline_voice::{
    GenerationRequest, LlmClient, Synthesizer, TokenStream, Transcriber, TtsStreamer, VoiceError,
};

pub const FRAME: Duration = Duration::from_millis(20);

/// Streams a fixed reply, optionally after a delay, honouring cancellation.
pub struct ScriptedLlm {
    tokens: Vec<String>,
    delay: Duration,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedLlm {
    pub fn new<I: IntoIterator<Item = &'static str>>(tokens: I) -> Arc<Self> {
        Self::delayed(tokens, Duration::ZERO)
    }

    pub fn delayed<I: IntoIterator<Item = &'static str>>(tokens: I, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tokens: tokens.into_iter().map(str::to_string).collect(),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn generate(&self, request: GenerationRequest, cancel: CancellationToken) -> TokenStream {
        self.requests.lock().unwrap().push(request);
        let (tx, stream) = TokenStream::channel(16);
        let tokens = self.tokens.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            for token in tokens {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(token) => if sent.is_err() { return; },
                }
            }
        });
        stream
    }

    async fn complete(&self, _system_prompt: &str, _user_message: &str) -> Result<String, VoiceError> {
        Ok("The caller booked a table.".to_string())
    }
}

/// Recognizes every utterance as the same text, optionally after a delay.
pub struct FixedTranscriber {
    text: String,
    delay: Duration,
    pub calls: AtomicUsize,
    /// Byte length of every utterance submitted, in call order.
    pub utterance_lens: Mutex<Vec<usize>>,
}

impl FixedTranscriber {
    pub fn new(text: &str) -> Arc<Self> {
        Self::delayed(text, Duration::ZERO)
    }

    pub fn delayed(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            delay,
            calls: AtomicUsize::new(0),
            utterance_lens: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, audio: &[u8], _format: MediaFormat) -> Result<String, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.utterance_lens.lock().unwrap().push(audio.len());
        tokio::time::sleep(self.delay).await;
        Ok(self.text.clone())
    }
}

/// Produces `samples` loud samples per phrase, or fails every request.
pub struct ToneSynth {
    samples: usize,
    fail: bool,
    pub phrases: Mutex<Vec<String>>,
}

impl ToneSynth {
    pub fn new(samples: usize) -> Arc<Self> {
        Arc::new(Self {
            samples,
            fail: false,
            phrases: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            samples: 0,
            fail: true,
            phrases: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Synthesizer for ToneSynth {
    async fn synthesize(&self, text: &str, _voice: &str, _sample_rate: u32) -> Result<Vec<i16>, VoiceError> {
        self.phrases.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(VoiceError::Tts("voice unavailable".to_string()));
        }
        Ok(vec![6000; self.samples])
    }
}

pub fn pipeline(
    llm: Arc<dyn LlmClient>,
    stt: Arc<dyn Transcriber>,
    synth: Arc<dyn Synthesizer>,
    settings: PipelineConfig,
) -> Arc<Pipeline> {
    Arc::new(Pipeline {
        llm,
        stt,
        tts: TtsStreamer::new(synth, FRAME),
        registry: CallRegistry::new(),
        stats: Arc::new(StatsAggregator::new(0.0, 10)),
        settings,
    })
}

pub fn profile(end_of_speech_ms: u64) -> Arc<AgentProfile> {
    Arc::new(AgentProfile {
        end_of_speech_timeout_ms: end_of_speech_ms,
        ..Default::default()
    })
}

pub fn start_event(call_id: &str) -> StartEvent {
    StartEvent {
        stream_id: format!("stream-{}", call_id),
        call_id: call_id.to_string(),
        call_leg_id: None,
        format: MediaFormat::default(),
    }
}

/// 20 ms of loud mu-law audio.
pub fn loud_frame(sequence: u64) -> AudioFrame {
    AudioFrame::new(vec![0x00; 160], MediaFormat::default(), sequence)
}

/// 20 ms of mu-law digital silence.
pub fn silent_frame(sequence: u64) -> AudioFrame {
    AudioFrame::new(vec![0xFF; 160], MediaFormat::default(), sequence)
}

pub fn outbound() -> (mpsc::Sender<OutboundFrame>, mpsc::Receiver<OutboundFrame>) {
    mpsc::channel(256)
}

/// Waits until the session enters `target`.
pub async fn wait_for_state(states: &mut broadcast::Receiver<StateChange>, target: CallState) {
    loop {
        match states.recv().await {
            Ok(change) if change.to == target => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                panic!("session ended before reaching {}", target)
            }
        }
    }
}
