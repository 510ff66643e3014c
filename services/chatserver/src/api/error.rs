//! HTTP error taxonomy.
//!
//! One constructor per taxonomy entry keeps response shapes identical across
//! handlers: `{ "code": ..., "message": ... }` with the matching status.
use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn error(status: StatusCode, code: &str, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
        },
    }
}

pub fn invalid_request(message: &str) -> ApiError {
    error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
}

/// `code` is one of `Unauthorized`, `TOKEN_INVALID`, `TOKEN_EXPIRED`.
pub fn unauthorized(code: &str, message: &str) -> ApiError {
    error(StatusCode::UNAUTHORIZED, code, message)
}

pub fn forbidden(message: &str) -> ApiError {
    error(StatusCode::FORBIDDEN, "FORBIDDEN", message)
}

pub fn not_found(message: &str) -> ApiError {
    error(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn already_exists(message: &str) -> ApiError {
    error(StatusCode::CONFLICT, "ALREADY_EXISTS", message)
}

pub fn internal(message: &str, err: &StoreError) -> ApiError {
    tracing::error!(error = ?err, "chat storage error");
    error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_SERVER_ERROR",
        message,
    )
}

pub fn internal_message(message: &str) -> ApiError {
    error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_SERVER_ERROR",
        message,
    )
}
