use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use adgen_core::error::CoreError;

use crate::engine::registry::DeleteError;
use crate::engine::AdmissionError;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `adgen_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Another job holds the accelerator.
    #[error("Busy. Retry after {retry_after}s")]
    Busy { retry_after: u64 },

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Busy { retry_after } => AppError::Busy { retry_after },
            AdmissionError::Invalid(core) => AppError::Core(core),
            AdmissionError::Launch(e) => AppError::InternalError(e.to_string()),
        }
    }
}

impl From<DeleteError> for AppError {
    fn from(err: DeleteError) -> Self {
        match err {
            DeleteError::NotFound(core) => AppError::Core(core),
            DeleteError::Active(id) => AppError::BadRequest(format!(
                "Cannot delete running job. Please stop it first using /stop/{id}"
            )),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} with id {id} not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
            },

            // --- Admission ---
            AppError::Busy { retry_after } => return busy_response(*retry_after),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// 503 with a `Retry-After` header so clients can back off without parsing
/// the body.
fn busy_response(retry_after: u64) -> Response {
    let body = json!({
        "status": "busy",
        "message": format!("Busy. Retry after {retry_after}s"),
        "retry_after": retry_after,
    });
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}
