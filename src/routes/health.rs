use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;
use crate::stats::{IngestStats, StatsSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub stats: StatsSnapshot,
}

pub(crate) async fn healthz_handler(State(stats): State<Arc<IngestStats>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        stats: stats.snapshot(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
