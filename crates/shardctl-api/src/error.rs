//! HTTP mapping of shardctl errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use shardctl_core::Error;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let msg = err.to_string();
        match err {
            Error::ShardNotFound(_) | Error::MigrationNotFound(_) => ApiError::NotFound(msg),
            Error::InvalidInput(_) | Error::InvalidTransition { .. } => ApiError::BadRequest(msg),
            Error::MigrationActive => ApiError::Conflict(msg),
            Error::ShardOpen { .. } | Error::ShardPing { .. } | Error::Timeout(_) => {
                ApiError::Unavailable(msg)
            }
            _ => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
