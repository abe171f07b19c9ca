use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppResult, RedeemError};
use crate::redeem::{RedeemOutcome, RedeemService, TokenContext};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AcknowledgeRequest {
    #[serde(default)]
    action: Option<String>,
}

/// Unparsable ids can never match a minted token.
fn parse_token_id(raw: &str) -> Result<Uuid, RedeemError> {
    Uuid::parse_str(raw.trim()).map_err(|_| RedeemError::NotFound)
}

pub(crate) async fn inspect_token(
    State(redeem): State<Arc<RedeemService>>,
    Path(token_id): Path<String>,
) -> AppResult<Json<TokenContext>> {
    let token_id = parse_token_id(&token_id)?;
    Ok(Json(redeem.inspect(token_id).await?))
}

pub(crate) async fn acknowledge(
    State(redeem): State<Arc<RedeemService>>,
    Path(token_id): Path<String>,
    Query(query): Query<AcknowledgeRequest>,
    body: Option<Json<AcknowledgeRequest>>,
) -> AppResult<Json<RedeemOutcome>> {
    let token_id = parse_token_id(&token_id)?;
    let action = body
        .and_then(|Json(body)| body.action)
        .or(query.action);
    Ok(Json(redeem.redeem(token_id, action.as_deref()).await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/token/{token_id}", get(inspect_token))
        .route("/acknowledge/{token_id}", post(acknowledge))
}
