use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::models::ErrorBody;
use crate::jobs::StoreError;

/// Error type for HTTP handlers; always rendered as `{error, message}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Anything that kept a webhook from producing a successful result.
    #[error("{0}")]
    WebhookFailed(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Body(#[from] JsonRejection),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::WebhookFailed(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process webhook",
                message,
            ),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "Not found", message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "Bad request", message),
            ApiError::Body(rejection) => (
                rejection.status(),
                "Invalid request body",
                rejection.body_text(),
            ),
            ApiError::Store(err) => {
                tracing::error!(error = %err, "job store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error",
                    err.to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: error.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
