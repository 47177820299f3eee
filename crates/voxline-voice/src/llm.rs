//! Streaming text generation.
//!
//! [`LlmClient::generate`] starts a chat completion and hands back a
//! [`TokenStream`] immediately; tokens arrive as the endpoint produces them.
//! The stream never surfaces an error: a request that fails before its first
//! token yields [`FALLBACK_UTTERANCE`] as if it were the whole reply, so the
//! caller is never left waiting on a reply that will not come.

use crate::config::LlmConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use voxline_types::{ConversationTurn, TurnRole};

/// Reply spoken when the generation endpoint cannot be reached.
pub const FALLBACK_UTTERANCE: &str = "I'm sorry, I'm having trouble responding right now.";

/// Summary recorded when post-call summarization fails.
pub const SUMMARY_FAILED: &str = "Failed to generate summary.";

const SUMMARY_SYSTEM_PROMPT: &str = "You are a helpful assistant that summarizes conversations.";

/// Tokens buffered between the HTTP reader and the consumer.
const TOKEN_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for ChatMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: turn.role.chat_role().to_string(),
            content: turn.text.clone(),
        }
    }
}

/// Everything needed to generate one agent reply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub prior_turns: Vec<ConversationTurn>,
    pub user_message: String,
    pub temperature: f32,
}

impl GenerationRequest {
    /// Builds the chat transcript: system prompt, prior turns, then the
    /// current utterance. Agent replies the caller never heard are left out.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.prior_turns.len() + 2);
        messages.push(ChatMessage::system(&self.system_prompt));
        messages.extend(
            self.prior_turns
                .iter()
                .filter(|turn| turn.spoken)
                .map(ChatMessage::from),
        );
        messages.push(ChatMessage::user(&self.user_message));
        messages
    }
}

/// Lazy, finite sequence of generated text tokens.
///
/// A stream is not restartable; a new generation needs a new stream.
pub struct TokenStream {
    rx: mpsc::Receiver<String>,
    done: bool,
}

impl TokenStream {
    /// Creates a connected sender/stream pair.
    pub fn channel(buffer: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx, done: false })
    }

    /// A stream that yields the given tokens and then ends.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let (tx, stream) = Self::channel(tokens.len());
        for token in tokens {
            // Capacity equals the token count, so this never fails.
            let _ = tx.try_send(token);
        }
        stream
    }

    pub async fn next_token(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(token) => Some(token),
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Starts a streaming generation.
    ///
    /// Tokens are yielded in arrival order. Once `cancel` fires the request
    /// is aborted and no further tokens are yielded.
    fn generate(&self, request: GenerationRequest, cancel: CancellationToken) -> TokenStream;

    /// Runs a non-streaming completion and returns the full reply.
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String, VoiceError>;
}

/// Summarizes a finished call with the profile's post-call prompt.
///
/// Never fails; an upstream error is logged and [`SUMMARY_FAILED`] returned.
pub async fn summarize(llm: &dyn LlmClient, post_prompt: &str, turns: &[ConversationTurn]) -> String {
    let transcript = turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                TurnRole::Caller => "Caller",
                TurnRole::Agent => "Agent",
            };
            format!("{}: {}", speaker, turn.text)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let user_message = format!("{}\n\n{}", post_prompt.trim(), transcript);

    match llm.complete(SUMMARY_SYSTEM_PROMPT, &user_message).await {
        Ok(summary) if !summary.trim().is_empty() => summary,
        Ok(_) => "No summary generated.".to_string(),
        Err(e) => {
            warn!("post-call summary failed: {}", e);
            SUMMARY_FAILED.to_string()
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed server-sent event from a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Token(String),
    Done,
}

/// Incremental parser for `data:` lines of a chat-completion SSE body.
///
/// Network chunks split lines (and UTF-8 sequences) arbitrarily, so bytes are
/// buffered until a full line is available.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Parses whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|token| !token.is_empty())
            .map(SseEvent::Token),
        Err(e) => {
            warn!("failed to parse completion stream chunk: {}", e);
            None
        }
    }
}

enum StreamOutcome {
    Completed(usize),
    Cancelled,
    Failed { yielded: usize, error: VoiceError },
}

/// Chat-completion client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, VoiceError> {
        if config.base_url.trim().is_empty() {
            return Err(VoiceError::Config("llm.base_url must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, messages: Vec<ChatMessage>, temperature: f32, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature,
            max_tokens: self.config.max_tokens,
            stream,
        }
    }
}

async fn stream_completion(
    request: reqwest::RequestBuilder,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return StreamOutcome::Cancelled,
        response = request.send() => response,
    };
    let response = match response {
        Ok(r) => r,
        Err(e) => return StreamOutcome::Failed { yielded: 0, error: e.into() },
    };
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return StreamOutcome::Failed {
            yielded: 0,
            error: VoiceError::Llm(format!("completion API error {}: {}", status, body)),
        };
    }

    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();
    let mut yielded = 0usize;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            chunk = body.next() => chunk,
        };
        let (events, ended) = match chunk {
            Some(Ok(bytes)) => (parser.push(&bytes), false),
            Some(Err(e)) => return StreamOutcome::Failed { yielded, error: e.into() },
            None => (parser.finish().into_iter().collect::<Vec<_>>(), true),
        };
        for event in events {
            match event {
                SseEvent::Token(token) => {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                        sent = tx.send(token) => sent,
                    };
                    if sent.is_err() {
                        // Consumer dropped the stream.
                        return StreamOutcome::Cancelled;
                    }
                    yielded += 1;
                }
                SseEvent::Done => return StreamOutcome::Completed(yielded),
            }
        }
        if ended {
            return StreamOutcome::Completed(yielded);
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    fn generate(&self, request: GenerationRequest, cancel: CancellationToken) -> TokenStream {
        let (tx, stream) = TokenStream::channel(TOKEN_CHANNEL_CAPACITY);
        let body = self.request_body(request.messages(), request.temperature, true);
        let http = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body);

        tokio::spawn(async move {
            match stream_completion(http, &tx, &cancel).await {
                StreamOutcome::Completed(0) => {
                    warn!("completion stream ended without tokens; using fallback reply");
                    let _ = tx.send(FALLBACK_UTTERANCE.to_string()).await;
                }
                StreamOutcome::Completed(count) => {
                    debug!(tokens = count, "completion stream finished");
                }
                StreamOutcome::Cancelled => {
                    debug!("completion stream cancelled");
                }
                StreamOutcome::Failed { yielded: 0, error } => {
                    warn!("completion request failed, using fallback reply: {}", error);
                    if !cancel.is_cancelled() {
                        let _ = tx.send(FALLBACK_UTTERANCE.to_string()).await;
                    }
                }
                StreamOutcome::Failed { yielded, error } => {
                    warn!(
                        tokens = yielded,
                        "completion stream failed mid-reply, keeping partial reply: {}", error
                    );
                }
            }
        });

        stream
    }

    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String, VoiceError> {
        let body = self.request_body(
            vec![ChatMessage::system(system_prompt), ChatMessage::user(user_message)],
            0.3,
            false,
        );
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Llm(format!("completion API error {}: {}", status, body)));
        }

        let parsed: ChatResponse = response.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_joins_lines_split_across_chunks() {
        let mut parser = SseParser::new();
        let first = parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(first.is_empty());
        let second = parser.push(b"lo\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(second, vec![SseEvent::Token("Hello".to_string()), SseEvent::Done]);
    }

    #[test]
    fn parser_skips_role_only_and_malformed_chunks() {
        let mut parser = SseParser::new();
        let events = parser.push(
            b": keep-alive\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\ndata: not-json\ndata: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\r\n",
        );
        assert_eq!(events, vec![SseEvent::Token(" there".to_string())]);
    }

    #[test]
    fn parser_finish_handles_missing_trailing_newline() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: [DONE]").is_empty());
        assert_eq!(parser.finish(), Some(SseEvent::Done));
    }

    #[test]
    fn messages_skip_unspoken_agent_turns() {
        let request = GenerationRequest {
            system_prompt: "be brief".to_string(),
            prior_turns: vec![
                ConversationTurn::caller("hi"),
                ConversationTurn::agent("never heard", false),
                ConversationTurn::agent("hello", true),
            ],
            user_message: "how are you".to_string(),
            temperature: 0.7,
        };
        let messages = request.messages();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[2].content, "hello");
        assert_eq!(messages[3].content, "how are you");
    }

    #[tokio::test]
    async fn from_tokens_yields_in_order_then_ends() {
        let mut stream = TokenStream::from_tokens(["Hello", " there"]);
        assert_eq!(stream.next_token().await.as_deref(), Some("Hello"));
        assert_eq!(stream.next_token().await.as_deref(), Some(" there"));
        assert_eq!(stream.next_token().await, None);
        assert_eq!(stream.next_token().await, None);
    }
}
