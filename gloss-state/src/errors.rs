use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

/// Error types for entitlement and metering operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("daily limit of {limit} reached")]
    QuotaExceeded {
        limit: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("database error: {0}")]
    Database(String),
}

impl IntoResponse for StateError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::NotFound(what) => (
                StatusCode::NOT_FOUND,
                json!({
                    "error": "not_found",
                    "message": format!("Not found: {}", what)
                }),
            ),
            Self::QuotaExceeded { limit, reset_at } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "daily_limit_reached",
                    "message": format!(
                        "Daily limit of {} explanations reached. Your usage resets at {} UTC.",
                        limit,
                        reset_at.format("%H:%M")
                    ),
                    "details": {
                        "limit": limit,
                        "reset_at": reset_at.to_rfc3339(),
                        "remaining_today": 0
                    }
                }),
            ),
            Self::Upstream(msg) => (
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": "upstream_unavailable",
                    "message": "A downstream service failed, please retry",
                    "retryable": true,
                    "details": msg
                }),
            ),
            Self::InvalidEvent(msg) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "invalid_event",
                    "message": msg
                }),
            ),
            Self::Database(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "database_error",
                    "message": msg
                }),
            ),
        };

        (status, Json(body)).into_response()
    }
}
