use crate::protocol::ProtocolError;
use crate::registry::RegistryError;
use thiserror::Error;
use voxline_voice::VoiceError;

/// Failures inside one call's pipeline.
///
/// None of these escape the call they happened in: each is either recovered
/// locally or ends that call's session.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed inbound frame. Dropped; the connection stays open.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Frame for a call with no active session. Ignored.
    #[error("no active session for call {0}")]
    UnknownSession(String),

    /// Recognition of a caller utterance failed. The utterance is dropped.
    #[error("speech recognition failed: {0}")]
    Recognition(#[source] VoiceError),

    /// Reply generation produced nothing usable.
    #[error("reply generation failed: {0}")]
    UpstreamGeneration(String),

    /// Synthesis of an agent reply failed. The reply is recorded unspoken.
    #[error("speech synthesis failed: {0}")]
    Synthesis(#[source] VoiceError),

    /// The media connection went away.
    #[error("transport closed: {0}")]
    Transport(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl PipelineError {
    /// Logs the error once at the level its handling calls for.
    pub fn log(&self, call_id: Option<&str>) {
        let call_id = call_id.unwrap_or("-");
        match self {
            Self::UnknownSession(_) => {
                tracing::debug!(call_id, "ignoring frame: {}", self);
            }
            Self::Transport(_) => {
                tracing::info!(call_id, "{}", self);
            }
            Self::Protocol(_)
            | Self::Recognition(_)
            | Self::UpstreamGeneration(_)
            | Self::Synthesis(_)
            | Self::Registry(_) => {
                tracing::warn!(call_id, "{}", self);
            }
        }
    }
}
