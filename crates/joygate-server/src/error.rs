use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Error taxonomy of the core. Webhook transport failures never appear here;
/// they land in the delivery ledger instead.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("{0}")]
    Quota(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Capacity(String),
}

impl ApiError {
    pub fn invalid(field: &str, detail: &str) -> ApiError {
        ApiError::Validation(format!("invalid {field}: {detail}"))
    }

    pub fn resource_busy(message: impl Into<String>) -> ApiError {
        ApiError::Conflict {
            code: "RESOURCE_BUSY",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(detail) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
            }
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "NOT_FOUND", "message": message })),
            )
                .into_response(),
            ApiError::Conflict { code, message } => (
                StatusCode::CONFLICT,
                Json(json!({ "error": code, "message": message })),
            )
                .into_response(),
            ApiError::Quota(message) => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "QUOTA_EXCEEDED", "message": message })),
            )
                .into_response(),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "RATE_LIMITED", "message": "per-minute rate limit exceeded" })),
            )
                .into_response(),
            ApiError::PermissionDenied(message) => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "PERMISSION_DENIED", "message": message })),
            )
                .into_response(),
            ApiError::Capacity(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "CAPACITY", "message": message })),
            )
                .into_response(),
        }
    }
}
