use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::evaluator::IngestMode;
use crate::state::AppState;
use crate::telemetry::decode;
use crate::types::AlertLevel;

#[derive(Debug, Serialize)]
pub(crate) struct SimulatedReading {
    id: i64,
    device_id: String,
    timestamp: DateTime<Utc>,
    wind_speed: f64,
    alert_level: AlertLevel,
    downtime_seconds: f64,
    dispatched: bool,
}

/// Runs a datagram body through the live ingest path without notifying contacts.
pub(crate) async fn simulate(State(state): State<AppState>, body: Bytes) -> AppResult<Json<SimulatedReading>> {
    let packet = decode(&body).map_err(|err| AppError::bad_request("invalid_packet", err.to_string()))?;
    let stored = state.handler.handle(&packet, IngestMode::Simulation).await?;
    Ok(Json(SimulatedReading {
        id: stored.id,
        alert_level: stored.alert_level(),
        device_id: stored.device_id,
        timestamp: stored.timestamp,
        wind_speed: stored.wind_speed,
        downtime_seconds: stored.downtime_seconds,
        dispatched: false,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/telemetry/simulate", post(simulate))
}
