use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::error::{AppError, AppResult};
use crate::gauge::GaugeReading;
use crate::state::AppState;

pub(crate) async fn device_gauge(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> AppResult<Json<GaugeReading>> {
    let reading = state
        .gauge
        .current(device_id.trim())
        .await
        .map_err(AppError::from_store)?;
    Ok(Json(reading))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/devices/{device_id}/gauge", get(device_gauge))
}
