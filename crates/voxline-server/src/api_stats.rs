use crate::stats::StatsSnapshot;
use crate::AppState;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// `GET /api/stats`: call counters and recent call history.
pub async fn get_stats_handler(Extension(state): Extension<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.pipeline.stats.snapshot())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCallsResponse {
    pub call_ids: Vec<String>,
}

/// `GET /api/calls`: call ids with a live session.
pub async fn list_calls_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<ActiveCallsResponse> {
    let mut call_ids = state.pipeline.registry.call_ids().await;
    call_ids.sort();
    Json(ActiveCallsResponse { call_ids })
}
