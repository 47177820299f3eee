//! One agent reply: recognize the caller's utterance, stream a generated
//! reply and speak it.
//!
//! A reply task never touches session state. It reports progress to its
//! session as [`ReplyEvent`]s and stops quietly once its cancellation token
//! fires, leaving no report behind for the cancelled generation.

use crate::error::PipelineError;
use crate::orchestrator::{OutboundFrame, Pipeline};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use voxline_types::{AgentProfile, ConversationTurn, MediaFormat};
use voxline_voice::{FrameStream, GenerationRequest, TokenStream};

/// Tokens buffered between generation and synthesis.
const TTS_TOKEN_BUFFER: usize = 64;

#[derive(Debug)]
pub(crate) enum ReplyEvent {
    /// The utterance was recognized as `text`.
    Recognized { generation: u64, text: String },
    /// The first reply token arrived; audio is on its way.
    Speaking { generation: u64 },
    /// The reply finished. `spoken` is false when synthesis failed.
    Completed {
        generation: u64,
        text: String,
        spoken: bool,
    },
    /// Nothing to say: recognition failed or came back empty, or generation
    /// produced no tokens.
    Abandoned { generation: u64 },
}

impl ReplyEvent {
    pub(crate) fn generation(&self) -> u64 {
        match self {
            Self::Recognized { generation, .. }
            | Self::Speaking { generation }
            | Self::Completed { generation, .. }
            | Self::Abandoned { generation } => *generation,
        }
    }
}

pub(crate) struct ReplyTask {
    pub pipeline: Arc<Pipeline>,
    pub call_id: String,
    pub generation: u64,
    pub profile: Arc<AgentProfile>,
    pub format: MediaFormat,
    pub prior_turns: Vec<ConversationTurn>,
    pub audio: Vec<u8>,
    pub cancel: CancellationToken,
    pub reports: mpsc::Sender<ReplyEvent>,
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Outbound frame counter shared by every reply of the call.
    pub outbound_sequence: Arc<AtomicU64>,
}

impl ReplyTask {
    pub(crate) async fn run(self) {
        let generation = self.generation;

        let Some(text) = self.recognize().await else {
            if !self.cancel.is_cancelled() {
                self.report(ReplyEvent::Abandoned { generation }).await;
            }
            return;
        };
        self.report(ReplyEvent::Recognized {
            generation,
            text: text.clone(),
        })
        .await;

        let request = GenerationRequest {
            system_prompt: self.profile.prompt.clone(),
            prior_turns: self.prior_turns.clone(),
            user_message: text,
            temperature: self.profile.temperature,
        };
        let mut tokens = self.pipeline.llm.generate(request, self.cancel.clone());

        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            token = tokens.next_token() => token,
        };
        let Some(first) = first else {
            if !self.cancel.is_cancelled() {
                PipelineError::UpstreamGeneration("reply stream ended without tokens".to_string())
                    .log(Some(&self.call_id));
                self.report(ReplyEvent::Abandoned { generation }).await;
            }
            return;
        };
        self.report(ReplyEvent::Speaking { generation }).await;

        let (token_tx, tts_tokens) = TokenStream::channel(TTS_TOKEN_BUFFER);
        let frames = self.pipeline.tts.synthesize(
            tts_tokens,
            &self.profile.voice,
            self.format,
            self.cancel.clone(),
        );
        let forward = tokio::spawn(forward_tokens(
            first,
            tokens,
            token_tx,
            self.cancel.clone(),
        ));

        let spoken = self.play(frames).await;
        let reply = forward.await.unwrap_or_default();
        if self.cancel.is_cancelled() {
            debug!(call_id = %self.call_id, generation, "reply interrupted");
            return;
        }

        self.report(ReplyEvent::Completed {
            generation,
            text: reply,
            spoken,
        })
        .await;
    }

    async fn recognize(&self) -> Option<String> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            result = self.pipeline.stt.transcribe(&self.audio, self.format) => result,
        };
        match result {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => {
                debug!(call_id = %self.call_id, "utterance recognized as empty");
                None
            }
            Err(e) => {
                PipelineError::Recognition(e).log(Some(&self.call_id));
                None
            }
        }
    }

    /// Sends synthesized frames to the caller as they are released. Returns
    /// `false` if synthesis failed.
    ///
    /// A far end that stops reading must not hold the reply past cancellation.
    async fn play(&self, mut frames: FrameStream) -> bool {
        while let Some(frame) = frames.next_frame().await {
            match frame {
                Ok(mut frame) => {
                    frame.sequence = self.outbound_sequence.fetch_add(1, Ordering::Relaxed);
                    let sent = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return true,
                        sent = self.outbound.send(OutboundFrame::Audio(frame)) => sent,
                    };
                    if sent.is_err() {
                        PipelineError::Transport("outbound audio channel closed".to_string())
                            .log(Some(&self.call_id));
                        return true;
                    }
                }
                Err(e) => {
                    PipelineError::Synthesis(e).log(Some(&self.call_id));
                    return false;
                }
            }
        }
        true
    }

    async fn report(&self, event: ReplyEvent) {
        // The session only goes away after awaiting this task.
        let _ = self.reports.send(event).await;
    }
}

/// Feeds generated tokens to synthesis and returns the full reply text.
///
/// Keeps draining the generation stream after synthesis stops so the reply
/// text is complete even when it could not be spoken.
async fn forward_tokens(
    first: String,
    mut tokens: TokenStream,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> String {
    let mut reply = String::new();
    let mut synthesis_open = true;
    let mut next = Some(first);
    while let Some(token) = next {
        reply.push_str(&token);
        if synthesis_open {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(token) => sent,
            };
            synthesis_open = sent.is_ok();
        }
        next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            token = tokens.next_token() => token,
        };
    }
    reply
}
