use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use threatlens_core::error::CoreError;
use threatlens_db::StoreError;
use threatlens_pipeline::PipelineError;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`PipelineError`] for domain failures and adds HTTP-specific
/// variants. Renders as `{ "error": ..., "code": ... }`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self::Pipeline(PipelineError::Store(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Pipeline(err) => classify_pipeline_error(err),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_pipeline_error(err: &PipelineError) -> (StatusCode, &'static str, String) {
    match err {
        PipelineError::JobNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        PipelineError::Store(StoreError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
        }
        PipelineError::Store(StoreError::Conflict(msg)) => {
            (StatusCode::CONFLICT, "CONFLICT", msg.clone())
        }
        PipelineError::InvalidResult(CoreError::Validation(msg)) => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
        }
        PipelineError::InvalidResult(CoreError::Conflict(msg)) => {
            (StatusCode::CONFLICT, "CONFLICT", msg.clone())
        }
        other => {
            tracing::error!(error = %other, "Pipeline error");
            internal()
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
