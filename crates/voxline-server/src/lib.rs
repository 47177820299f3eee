//! Voxline server library logic.
//!
//! Hosts the media stream endpoint that runs one AI conversation per phone
//! call, plus health and statistics endpoints.

pub mod api_media;
pub mod api_stats;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod profiles;
pub mod protocol;
pub mod registry;
mod reply;
pub mod stats;

use axum::{routing::get, Extension, Json, Router};
use config::Config;
use orchestrator::Pipeline;
use profiles::AgentProfileStore;
use registry::CallRegistry;
use serde_json::{json, Value};
use stats::StatsAggregator;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use voxline_voice::{HttpLlmClient, HttpSynthesizer, HttpTranscriber, TtsStreamer, VoiceError};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Capabilities, registry and stats shared by every call.
    pub pipeline: Arc<Pipeline>,
    /// Agent profiles selectable per call.
    pub profiles: Arc<AgentProfileStore>,
}

impl AppState {
    /// Builds the state with HTTP-backed capabilities from configuration.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError` if an HTTP client cannot be constructed.
    pub fn from_config(config: &Config) -> Result<Self, VoiceError> {
        let llm = HttpLlmClient::new(config.llm.clone())?;
        let stt = HttpTranscriber::new(config.stt.clone())?;
        let synthesizer = HttpSynthesizer::new(config.tts.clone())?;

        let pipeline = Pipeline {
            llm: Arc::new(llm),
            stt: Arc::new(stt),
            tts: TtsStreamer::new(Arc::new(synthesizer), config.tts.frame_duration()),
            registry: CallRegistry::new(),
            stats: Arc::new(StatsAggregator::new(
                config.stats.cost_per_minute,
                config.stats.history_limit,
            )),
            settings: config.pipeline.clone(),
        };

        Ok(Self {
            pipeline: Arc::new(pipeline),
            profiles: Arc::new(AgentProfileStore::new(
                config.agents.clone(),
                config.default_agent.as_deref(),
            )),
        })
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(api_stats::get_stats_handler))
        .route("/api/calls", get(api_stats::list_calls_handler))
        .route("/media", get(api_media::media_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
