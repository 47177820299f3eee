//! Media stream WebSocket endpoint.
//!
//! One connection carries one call. The connection task only decodes frames
//! and forwards them to the call's session; all pipeline work happens in the
//! session task.

use crate::error::PipelineError;
use crate::orchestrator::{start_call, CallTask, OutboundFrame, SessionEvent};
use crate::protocol::{self, InboundEvent, MediaEvent, ProtocolError, StartEvent, StopEvent};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use voxline_types::{AgentProfile, AudioFrame};

/// Outbound frames buffered for a slow socket. Audio is paced, so this only
/// fills if the far end stops reading.
const OUTBOUND_BUFFER: usize = 256;

/// Query parameters for the media connection.
#[derive(Debug, Deserialize)]
pub struct MediaParams {
    /// Agent profile id; unknown or absent uses the default agent.
    pub agent: Option<String>,
}

pub async fn media_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<MediaParams>,
) -> impl IntoResponse {
    let profile = state.profiles.resolve(params.agent.as_deref());
    tracing::info!(
        remote_addr = %addr,
        agent = %profile.id,
        "media stream connecting"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, profile))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, profile: Arc<AgentProfile>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);

    // Forward session output to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                OutboundFrame::Audio(frame) => Message::Binary(frame.payload.into()),
                OutboundFrame::Clear => Message::Text(protocol::clear_frame().into()),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut connection = MediaConnection {
        state,
        profile,
        outbound: tx,
        call: None,
        inbound_sequence: 0,
    };

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                PipelineError::Transport(e.to_string()).log(connection.call_id());
                break;
            }
        };
        match message {
            Message::Text(text) => match protocol::decode_text(text.as_str()) {
                Ok(event) => connection.handle_event(event).await,
                Err(e) => PipelineError::from(e).log(connection.call_id()),
            },
            Message::Binary(bytes) => {
                PipelineError::from(ProtocolError::UnexpectedBinary(bytes.len()))
                    .log(connection.call_id());
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    connection.close().await;
    let _ = send_task.await;
}

struct MediaConnection {
    state: Arc<AppState>,
    profile: Arc<AgentProfile>,
    outbound: mpsc::Sender<OutboundFrame>,
    call: Option<CallTask>,
    inbound_sequence: u64,
}

impl MediaConnection {
    fn call_id(&self) -> Option<&str> {
        self.call.as_ref().map(|c| c.handle.call_id.as_str())
    }

    async fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connected => tracing::debug!("media stream connected"),
            InboundEvent::Start(start) => self.on_start(start).await,
            InboundEvent::Media(media) => self.on_media(media).await,
            InboundEvent::Stop(stop) => self.on_stop(stop).await,
            InboundEvent::Other(name) => {
                tracing::debug!(event = %name, call_id = self.call_id().unwrap_or("-"), "ignoring media stream event");
            }
        }
    }

    async fn on_start(&mut self, start: StartEvent) {
        if let Some(active) = &self.call {
            tracing::warn!(
                call_id = %active.handle.call_id,
                ignored_call_id = %start.call_id,
                "second start on one media connection ignored"
            );
            return;
        }
        let call_id = start.call_id.clone();
        match start_call(
            self.state.pipeline.clone(),
            start,
            self.profile.clone(),
            self.outbound.clone(),
        )
        .await
        {
            Ok(call) => {
                self.inbound_sequence = 0;
                self.call = Some(call);
            }
            Err(e) => e.log(Some(&call_id)),
        }
    }

    async fn on_media(&mut self, media: MediaEvent) {
        if !media.is_inbound() {
            return;
        }
        let Some(active) = &self.call else {
            PipelineError::UnknownSession("<none>".to_string()).log(None);
            return;
        };
        if media
            .stream_id
            .as_deref()
            .is_some_and(|id| id != active.stream_id)
        {
            PipelineError::UnknownSession(active.handle.call_id.clone()).log(None);
            return;
        }

        // The session may have ended or been replaced since this connection
        // started it.
        let handle = match self.state.pipeline.registry.get(&active.handle.call_id).await {
            Ok(handle) if handle.session_id == active.handle.session_id => handle,
            _ => {
                PipelineError::UnknownSession(active.handle.call_id.clone()).log(None);
                return;
            }
        };

        let mut frame = AudioFrame::new(media.payload, active.format, self.inbound_sequence);
        frame.timestamp_ms = media.timestamp_ms;
        self.inbound_sequence += 1;
        handle.send(SessionEvent::Media(frame)).await;
    }

    async fn on_stop(&mut self, stop: StopEvent) {
        let matches = match (&self.call, stop.call_id.as_deref()) {
            (Some(active), Some(id)) => active.handle.call_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            PipelineError::UnknownSession(stop.call_id.unwrap_or_else(|| "<none>".to_string()))
                .log(None);
            return;
        }
        if let Some(call) = self.call.take() {
            call.handle.send(SessionEvent::Stop).await;
            if let Some(summary) = call.join().await {
                tracing::debug!(
                    call_id = %summary.call_id,
                    turns = summary.turns.len(),
                    "media stream stopped"
                );
            }
        }
    }

    /// The socket is gone; end any call still running on it.
    async fn close(mut self) {
        if let Some(call) = self.call.take() {
            call.handle.send(SessionEvent::TransportClosed).await;
            call.join().await;
        }
    }
}
