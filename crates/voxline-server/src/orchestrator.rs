//! Per-call conversation state machine.
//!
//! Each call runs as one task that exclusively owns its conversation state:
//! the inbound audio accumulator, the turn log and the current
//! [`CallState`]. Everything that can change that state arrives as a message
//! on one of the task's channels (inbound events from the socket, progress
//! reports from the reply task) or as the end-of-speech deadline, and is
//! handled one at a time by [`CallSession::run`].
//!
//! Recognition, generation and synthesis for one utterance run in a separate
//! reply task so the session stays responsive to barge-in. Each reply task
//! carries a generation number; reports from a reply that has since been
//! cancelled are discarded.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::protocol::StartEvent;
use crate::registry::{CallRegistry, NewSession, SessionHandle};
use crate::reply::{ReplyEvent, ReplyTask};
use crate::stats::StatsAggregator;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;
use voxline_types::{AgentProfile, AudioFrame, CallState, ConversationTurn, MediaFormat};
use voxline_voice::{codec, summarize, LlmClient, Transcriber, TtsStreamer};

/// Reply progress reports buffered per session.
const REPLY_CHANNEL_CAPACITY: usize = 16;

/// Shared capabilities and bookkeeping used by every call.
pub struct Pipeline {
    pub llm: Arc<dyn LlmClient>,
    pub stt: Arc<dyn Transcriber>,
    pub tts: TtsStreamer,
    pub registry: CallRegistry,
    pub stats: Arc<StatsAggregator>,
    pub settings: PipelineConfig,
}

/// Input to a session from its media connection.
#[derive(Debug)]
pub enum SessionEvent {
    /// One inbound audio frame from the caller.
    Media(AudioFrame),
    /// The far end ended the stream.
    Stop,
    /// The media connection closed without a `stop`.
    TransportClosed,
}

/// Output from a session to its media connection.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Audio(AudioFrame),
    /// Discard audio already sent but not yet played.
    Clear,
}

/// One state transition, as published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub call_id: String,
    pub from: CallState,
    pub to: CallState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Stopped,
    TransportClosed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::TransportClosed => f.write_str("transport closed"),
        }
    }
}

/// What a finished session leaves behind.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub call_id: String,
    pub session_id: Uuid,
    pub turns: Vec<ConversationTurn>,
    /// Every state entered, in order, starting with `Listening`.
    pub transitions: Vec<CallState>,
    pub duration: Duration,
    pub reason: EndReason,
}

/// A running session and the task driving it.
pub struct CallTask {
    pub handle: SessionHandle,
    pub stream_id: String,
    pub format: MediaFormat,
    task: JoinHandle<SessionSummary>,
}

impl CallTask {
    /// Waits for the session to finish. Returns `None` if the task panicked.
    pub async fn join(self) -> Option<SessionSummary> {
        match self.task.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(call_id = %self.handle.call_id, "call session task failed: {}", e);
                None
            }
        }
    }
}

/// Registers a session for `start` and spawns its task.
///
/// Audio for the caller is sent to `outbound`. Fails if a session for the
/// same call id is already live.
pub async fn start_call(
    pipeline: Arc<Pipeline>,
    start: StartEvent,
    profile: Arc<AgentProfile>,
    outbound: mpsc::Sender<OutboundFrame>,
) -> Result<CallTask, PipelineError> {
    let NewSession { handle, events } = pipeline
        .registry
        .create(
            &start.call_id,
            profile,
            pipeline.settings.inbound_channel_capacity,
        )
        .await?;
    pipeline.stats.call_started();

    info!(
        call_id = %start.call_id,
        stream_id = %start.stream_id,
        call_leg_id = start.call_leg_id.as_deref().unwrap_or("-"),
        agent = %handle.profile.id,
        codec = %start.format.codec,
        sample_rate = start.format.sample_rate,
        "call session started"
    );

    let stream_id = start.stream_id.clone();
    let format = start.format;
    let session = CallSession::new(pipeline, handle.clone(), start, events, outbound);
    let task = tokio::spawn(session.run());
    Ok(CallTask {
        handle,
        stream_id,
        format,
        task,
    })
}

struct ActiveReply {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// The utterance audio, kept until the reply reports it recognized.
    unrecognized: Option<Vec<u8>>,
}

struct CallSession {
    pipeline: Arc<Pipeline>,
    handle: SessionHandle,
    stream_id: String,
    format: MediaFormat,
    events: mpsc::Receiver<SessionEvent>,
    outbound: mpsc::Sender<OutboundFrame>,
    outbound_sequence: Arc<AtomicU64>,
    state_tx: broadcast::Sender<StateChange>,
    state: CallState,
    transitions: Vec<CallState>,
    accumulator: Vec<u8>,
    /// Arrival of the latest caller speech in the current utterance. `None`
    /// while no utterance is in progress, which disarms the end-of-speech timer.
    last_speech: Option<Instant>,
    turns: Vec<ConversationTurn>,
    cancel: CancellationToken,
    generation: u64,
    reply: Option<ActiveReply>,
    /// Reply tasks that were cancelled or have reported completion.
    retired: Vec<JoinHandle<()>>,
    replies_tx: mpsc::Sender<ReplyEvent>,
    replies: mpsc::Receiver<ReplyEvent>,
    started: Instant,
}

impl CallSession {
    fn new(
        pipeline: Arc<Pipeline>,
        handle: SessionHandle,
        start: StartEvent,
        events: mpsc::Receiver<SessionEvent>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        let (replies_tx, replies) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        Self {
            state_tx: handle.state_sender(),
            pipeline,
            handle,
            stream_id: start.stream_id,
            format: start.format,
            events,
            outbound,
            outbound_sequence: Arc::new(AtomicU64::new(0)),
            state: CallState::Idle,
            transitions: Vec::new(),
            accumulator: Vec::new(),
            last_speech: None,
            turns: Vec::new(),
            cancel: CancellationToken::new(),
            generation: 0,
            reply: None,
            retired: Vec::new(),
            replies_tx,
            replies,
            started: Instant::now(),
        }
    }

    async fn run(mut self) -> SessionSummary {
        self.transition(CallState::Listening);

        let reason = loop {
            let deadline = self.end_of_speech_deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SessionEvent::Media(frame)) => self.on_media(frame),
                    Some(SessionEvent::Stop) => break EndReason::Stopped,
                    Some(SessionEvent::TransportClosed) | None => break EndReason::TransportClosed,
                },
                Some(report) = self.replies.recv() => self.on_reply(report),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.finish_utterance();
                }
            }
        };

        self.teardown(reason).await
    }

    fn end_of_speech_deadline(&self) -> Option<Instant> {
        if self.state != CallState::Listening {
            return None;
        }
        self.last_speech
            .map(|at| at + self.handle.profile.end_of_speech_timeout())
    }

    fn on_media(&mut self, frame: AudioFrame) {
        let speech = !frame.is_empty()
            && codec::rms(&frame.payload, frame.codec)
                >= self.pipeline.settings.speech_rms_threshold;

        match self.state {
            CallState::Listening => {
                if speech {
                    self.accumulator.extend_from_slice(&frame.payload);
                    self.last_speech = Some(Instant::now());
                } else if self.last_speech.is_some() {
                    // Quiet audio inside an utterance is kept but does not
                    // extend it.
                    self.accumulator.extend_from_slice(&frame.payload);
                }
            }
            CallState::Thinking | CallState::Speaking if speech => {
                self.barge_in();
                self.accumulator.extend_from_slice(&frame.payload);
                self.last_speech = Some(Instant::now());
            }
            _ => {}
        }
    }

    /// Caller audio has been silent for the end-of-speech timeout: hand the
    /// utterance to a reply task.
    fn finish_utterance(&mut self) {
        self.last_speech = None;
        let audio = std::mem::take(&mut self.accumulator);
        self.generation += 1;
        let cancel = self.cancel.child_token();

        debug!(
            call_id = %self.handle.call_id,
            generation = self.generation,
            bytes = audio.len(),
            "end of speech"
        );

        let task = ReplyTask {
            pipeline: self.pipeline.clone(),
            call_id: self.handle.call_id.clone(),
            generation: self.generation,
            profile: self.handle.profile.clone(),
            format: self.format,
            prior_turns: self.turns.clone(),
            audio: audio.clone(),
            cancel: cancel.clone(),
            reports: self.replies_tx.clone(),
            outbound: self.outbound.clone(),
            outbound_sequence: self.outbound_sequence.clone(),
        };
        self.reply = Some(ActiveReply {
            generation: self.generation,
            cancel,
            task: tokio::spawn(task.run()),
            unrecognized: Some(audio),
        });
        self.transition(CallState::Thinking);
    }

    fn barge_in(&mut self) {
        let was_speaking = self.state == CallState::Speaking;
        // Speech the interrupted reply never recognized starts the new utterance.
        let carried = self.reply.as_mut().and_then(|r| r.unrecognized.take());
        self.retire_reply(true);
        if was_speaking {
            // Never wait on a far end that stopped reading.
            match self.outbound.try_send(OutboundFrame::Clear) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    PipelineError::Transport("outbound backlog full, clear dropped".to_string())
                        .log(Some(&self.handle.call_id));
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(call_id = %self.handle.call_id, "outbound closed before clear");
                }
            }
        }
        info!(
            call_id = %self.handle.call_id,
            generation = self.generation,
            state = %self.state,
            carried_bytes = carried.as_ref().map_or(0, Vec::len),
            "caller barged in"
        );
        self.accumulator = carried.unwrap_or_default();
        self.last_speech = None;
        self.transition(CallState::Listening);
    }

    fn on_reply(&mut self, report: ReplyEvent) {
        let current = self.reply.as_ref().map(|r| r.generation);
        if current != Some(report.generation()) {
            debug!(
                call_id = %self.handle.call_id,
                generation = report.generation(),
                "discarding report from cancelled reply"
            );
            return;
        }

        match report {
            ReplyEvent::Recognized { text, .. } => {
                if let Some(reply) = self.reply.as_mut() {
                    reply.unrecognized = None;
                }
                self.turns.push(ConversationTurn::caller(text));
            }
            ReplyEvent::Speaking { .. } => self.transition(CallState::Speaking),
            ReplyEvent::Completed { text, spoken, .. } => {
                if !text.trim().is_empty() {
                    self.turns.push(ConversationTurn::agent(text, spoken));
                }
                self.retire_reply(false);
                self.transition(CallState::Listening);
            }
            ReplyEvent::Abandoned { .. } => {
                self.retire_reply(false);
                self.transition(CallState::Listening);
            }
        }
    }

    fn retire_reply(&mut self, cancel: bool) {
        if let Some(reply) = self.reply.take() {
            if cancel {
                reply.cancel.cancel();
            }
            self.retired.retain(|task| !task.is_finished());
            self.retired.push(reply.task);
        }
    }

    fn transition(&mut self, to: CallState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        self.transitions.push(to);
        debug!(
            call_id = %self.handle.call_id,
            stream_id = %self.stream_id,
            generation = self.generation,
            %from,
            state = %to,
            "state transition"
        );
        // No subscribers is fine.
        let _ = self.state_tx.send(StateChange {
            call_id: self.handle.call_id.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    async fn teardown(mut self, reason: EndReason) -> SessionSummary {
        self.transition(CallState::Ended);
        self.cancel.cancel();
        self.retire_reply(true);
        // Reply tasks must not block reporting to a session that stopped listening.
        self.replies.close();
        for task in self.retired.drain(..) {
            let _ = task.await;
        }
        self.events.close();

        let call_id = self.handle.call_id.clone();
        self.pipeline
            .registry
            .remove_session(&call_id, self.handle.session_id)
            .await;

        let duration = self.started.elapsed();
        let record = self
            .pipeline
            .stats
            .call_ended(&call_id, duration, self.turns.len());
        info!(
            call_id = %call_id,
            stream_id = %self.stream_id,
            reason = %reason,
            turns = self.turns.len(),
            duration_secs = record.duration_secs,
            "call session ended"
        );

        let profile = self.handle.profile.clone();
        if profile.wants_summary() && !self.turns.is_empty() {
            let llm = self.pipeline.llm.clone();
            let turns = self.turns.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move {
                let summary = summarize(llm.as_ref(), &profile.post_prompt, &turns).await;
                info!(call_id = %call_id, summary = %summary, "post-call summary");
            });
        }

        SessionSummary {
            call_id,
            session_id: self.handle.session_id,
            turns: self.turns,
            transitions: self.transitions,
            duration,
            reason,
        }
    }
}
