use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("payment request not found")]
    NotFound,

    #[error("payment request expired")]
    Expired,

    #[error("payment request already resolved")]
    AlreadyResolved,

    #[error("payment request has not been signed")]
    NotSigned,

    #[error("no free pin after {attempts} attempts")]
    ResourceExhausted { attempts: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

// Stores report through anyhow; keep database failures distinguishable.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<sqlx::Error>() {
            Ok(db) => AppError::Database(db),
            Err(other) => AppError::Internal(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "request_not_found",
                "payment request not found".to_string(),
            ),
            AppError::Expired => (
                StatusCode::GONE,
                "expired_error",
                "request_expired",
                "payment request expired".to_string(),
            ),
            AppError::AlreadyResolved => (
                StatusCode::CONFLICT,
                "conflict_error",
                "already_resolved",
                "this payment was already handled elsewhere".to_string(),
            ),
            AppError::NotSigned => (
                StatusCode::CONFLICT,
                "conflict_error",
                "not_signed",
                "payment request is still waiting for the payer's signature".to_string(),
            ),
            AppError::ResourceExhausted { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "capacity_error",
                "pin_space_exhausted",
                "could not allocate a pin, retry request creation".to_string(),
            ),
            AppError::InvalidInput(reason) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_input",
                reason.clone(),
            ),
            AppError::RelayUnavailable(e) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "relay_unavailable",
                e.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        // Pin exhaustion clears as live requests resolve or expire
        if matches!(self, AppError::ResourceExhausted { .. }) {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("5"),
            );
        }

        response
    }
}
