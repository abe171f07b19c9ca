use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    /// Maps a store failure, looking through `anyhow` context for the underlying `sqlx` error.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<sqlx::Error>() {
            Ok(db_err) => map_db_error(db_err),
            Err(other) => {
                tracing::error!(error = %format!("{other:#}"), "internal error");
                Self::internal("Internal server error")
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub fn map_db_error(err: sqlx::Error) -> AppError {
    let (status, code) = match &err {
        sqlx::Error::RowNotFound => (StatusCode::NOT_FOUND, "not_found"),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => (StatusCode::CONFLICT, "conflict"), // unique_violation
            Some("23503") => (StatusCode::BAD_REQUEST, "invalid_request"), // foreign_key_violation
            Some("22P02") => (StatusCode::BAD_REQUEST, "invalid_request"), // invalid_text_representation
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        },
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
    };

    tracing::error!(error = %err, status = %status, "database error");

    let message = match status {
        StatusCode::NOT_FOUND => "Resource not found",
        StatusCode::CONFLICT => "Resource already exists",
        StatusCode::BAD_REQUEST => "Invalid request",
        _ => "Database error",
    };
    AppError::new(status, code, message)
}

/// Why an otherwise well-formed packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("unknown device")]
    UnknownDevice,
    #[error("no alert thresholds configured")]
    MissingThresholds,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("packet rejected: {0}")]
    Rejected(RejectReason),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RedeemError {
    #[error("token not found")]
    NotFound,
    #[error("token already used")]
    AlreadyUsed,
    #[error("token expired")]
    Expired,
    #[error("action {0:?} is not permitted")]
    InvalidAction(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<RedeemError> for AppError {
    fn from(err: RedeemError) -> Self {
        match err {
            RedeemError::NotFound => AppError::not_found("Token not found"),
            RedeemError::AlreadyUsed => {
                AppError::bad_request("already_used", "Token has already been used")
            }
            RedeemError::Expired => AppError::bad_request("expired", "Token has expired"),
            RedeemError::InvalidAction(action) => AppError::bad_request(
                "invalid_action",
                format!("Action {action:?} is not permitted"),
            ),
            RedeemError::Store(err) => AppError::from_store(err),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Rejected(RejectReason::UnknownDevice) => {
                AppError::not_found("Unknown device")
            }
            IngestError::Rejected(RejectReason::MissingThresholds) => AppError::bad_request(
                "missing_thresholds",
                "Device has no alert thresholds configured",
            ),
            IngestError::Store(err) => AppError::from_store(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{count} unprocessed readings at or before retention cutoff {cutoff}")]
    StaleUnprocessed { count: u64, cutoff: DateTime<Utc> },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("email transport is not configured")]
    NotConfigured,
    #[error("email request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("email API rejected message with status {status}")]
    Rejected { status: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redeem_errors_map_to_client_statuses() {
        assert_eq!(AppError::from(RedeemError::NotFound).status, StatusCode::NOT_FOUND);
        assert_eq!(AppError::from(RedeemError::AlreadyUsed).status, StatusCode::BAD_REQUEST);
        assert_eq!(AppError::from(RedeemError::Expired).status, StatusCode::BAD_REQUEST);
        let invalid = AppError::from(RedeemError::InvalidAction("snooze_9h".into()));
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.code, "invalid_action");
        let store = AppError::from(RedeemError::Store(anyhow::anyhow!("pool closed")));
        assert_eq!(store.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn store_errors_unwrap_sqlx_through_context() {
        let err = anyhow::Error::new(sqlx::Error::RowNotFound).context("load token");
        assert_eq!(AppError::from_store(err).status, StatusCode::NOT_FOUND);
    }
}
