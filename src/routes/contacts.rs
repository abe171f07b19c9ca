use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::redeem::RedeemService;
use crate::state::AppState;
use crate::types::UnsubscribeOutcome;

/// Repeating the request after a success reports `contact_removed: false`.
pub(crate) async fn unsubscribe(
    State(redeem): State<Arc<RedeemService>>,
    Path((contact_id, device_id)): Path<(String, String)>,
) -> AppResult<Json<UnsubscribeOutcome>> {
    let contact_id = contact_id.trim().parse::<i64>().map_err(|_| {
        AppError::bad_request("invalid_contact_id", format!("Invalid contact id {contact_id:?}"))
    })?;
    let outcome = redeem
        .unsubscribe(contact_id, &device_id)
        .await
        .map_err(AppError::from_store)?;
    Ok(Json(outcome))
}

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/unsubscribe/{contact_id}/{device_id}",
        get(unsubscribe).post(unsubscribe),
    )
}
