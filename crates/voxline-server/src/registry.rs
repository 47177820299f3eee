//! Registry of live call sessions.
//!
//! The registry maps a call-control id to the handle of the task running that
//! call. It never owns conversation state; that lives in the session task and
//! is reached only through the handle's event channel.

use crate::orchestrator::{SessionEvent, StateChange};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;
use voxline_types::AgentProfile;

/// State changes buffered per subscriber before it starts lagging.
const STATE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a session for call {0} already exists")]
    AlreadyExists(String),

    #[error("no session for call {0}")]
    NotFound(String),
}

/// Cloneable reference to one running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub call_id: String,
    /// Distinguishes this session from an earlier one with the same call id.
    pub session_id: Uuid,
    pub profile: Arc<AgentProfile>,
    events: mpsc::Sender<SessionEvent>,
    state_tx: broadcast::Sender<StateChange>,
}

impl SessionHandle {
    /// Queues an event for the session. Returns `false` if the session has
    /// already finished.
    pub async fn send(&self, event: SessionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Subscribes to the session's state transitions from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    pub(crate) fn state_sender(&self) -> broadcast::Sender<StateChange> {
        self.state_tx.clone()
    }
}

/// A freshly registered session: its handle plus the receiving end of its
/// event channel, which the session task takes ownership of.
pub struct NewSession {
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<SessionEvent>,
}

type SessionMap = HashMap<String, SessionHandle>;

/// At most one session per call id.
#[derive(Debug, Clone, Default)]
pub struct CallRegistry {
    sessions: Arc<RwLock<SessionMap>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session for `call_id`.
    ///
    /// Fails with [`RegistryError::AlreadyExists`] rather than replacing a
    /// live session, so an in-flight pipeline is never orphaned.
    pub async fn create(
        &self,
        call_id: &str,
        profile: Arc<AgentProfile>,
        capacity: usize,
    ) -> Result<NewSession, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(call_id) {
            return Err(RegistryError::AlreadyExists(call_id.to_string()));
        }

        let (events_tx, events) = mpsc::channel(capacity.max(1));
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let handle = SessionHandle {
            call_id: call_id.to_string(),
            session_id: Uuid::new_v4(),
            profile,
            events: events_tx,
            state_tx,
        };
        sessions.insert(call_id.to_string(), handle.clone());
        Ok(NewSession { handle, events })
    }

    pub async fn get(&self, call_id: &str) -> Result<SessionHandle, RegistryError> {
        self.sessions
            .read()
            .await
            .get(call_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(call_id.to_string()))
    }

    /// Removes whatever session is registered for `call_id`. A no-op if none is.
    ///
    /// This only unregisters the session; the task keeps running until it
    /// receives `Stop` or its connection closes.
    pub async fn remove(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(call_id)
    }

    /// Removes the session for `call_id` only if it is still `session_id`.
    ///
    /// A session tearing down late must not evict a newer session that
    /// reused its call id. Returns whether anything was removed.
    pub async fn remove_session(&self, call_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(call_id) {
            Some(current) if current.session_id == session_id => {
                sessions.remove(call_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn call_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Arc<AgentProfile> {
        Arc::new(AgentProfile::default())
    }

    #[tokio::test]
    async fn create_rejects_duplicate_call_id() {
        let registry = CallRegistry::new();
        let first = registry.create("C1", profile(), 8).await.unwrap();

        let err = registry.create("C1", profile(), 8).await.err();
        assert_eq!(err, Some(RegistryError::AlreadyExists("C1".to_string())));

        // The original session is untouched.
        let current = registry.get("C1").await.unwrap();
        assert_eq!(current.session_id, first.handle.session_id);
    }

    #[tokio::test]
    async fn get_unknown_call_is_not_found() {
        let registry = CallRegistry::new();
        assert_eq!(
            registry.get("nope").await.err(),
            Some(RegistryError::NotFound("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = CallRegistry::new();
        registry.create("C1", profile(), 8).await.unwrap();

        assert!(registry.remove("C1").await.is_some());
        assert!(registry.remove("C1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn stale_session_removal_keeps_newer_session() {
        let registry = CallRegistry::new();
        let old = registry.create("C1", profile(), 8).await.unwrap();
        registry.remove("C1").await;
        let new = registry.create("C1", profile(), 8).await.unwrap();

        assert!(!registry.remove_session("C1", old.handle.session_id).await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.remove_session("C1", new.handle.session_id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn handle_send_fails_once_session_dropped() {
        let registry = CallRegistry::new();
        let NewSession { handle, events } = registry.create("C1", profile(), 8).await.unwrap();
        assert!(handle.send(SessionEvent::Stop).await);
        drop(events);
        assert!(!handle.send(SessionEvent::Stop).await);
    }
}
