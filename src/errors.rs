use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("warm-up request failed: {0}")]
    WarmupRequest(String),
    #[error("warm-up response invalid: {0}")]
    WarmupData(String),
    #[error("internal feed error: {0}")]
    Internal(String),
}

/// Errors surfaced by the HTTP handlers. Feed-level failures never reach
/// this layer: warm-up errors are swallowed inside the feed and the price
/// read is pure, so bad client input is the only error a handler produces.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message),
        };

        let body = ErrorBody { code, message };
        (status, Json(body)).into_response()
    }
}
