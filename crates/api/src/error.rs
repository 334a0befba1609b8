use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mvstudio_core::error::CoreError;
use mvstudio_orchestrator::OrchestratorError;
use mvstudio_providers::error::ProviderError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps the domain, database, and provider layers. Implements
/// [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `mvstudio_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A provider error surfaced while decoding a callback.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Core(e) => AppError::Core(e),
            OrchestratorError::Database(e) => AppError::Database(e),
            OrchestratorError::Provider(e) => AppError::Provider(e),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Core(CoreError::Validation(errors.to_string()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { .. } => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", core.to_string())
                }
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::UnknownOperation(_) => {
                    (StatusCode::BAD_REQUEST, "UNKNOWN_OPERATION", core.to_string())
                }
                CoreError::UnroutableOperation(_) => {
                    (StatusCode::BAD_REQUEST, "UNROUTABLE_OPERATION", core.to_string())
                }
                CoreError::InsufficientCredits { .. } => (
                    StatusCode::PAYMENT_REQUIRED,
                    "INSUFFICIENT_CREDITS",
                    core.to_string(),
                ),
                CoreError::MissingCredential(provider) => {
                    tracing::error!(provider = %provider, "Provider credential not configured");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "PROVIDER_NOT_CONFIGURED",
                        "The generation provider is not available".to_string(),
                    )
                }
                CoreError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "CONFLICT", core.to_string())
                }
                CoreError::Unauthorized(msg) => {
                    (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
                }
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    internal()
                }
            },

            // --- Database errors ---
            AppError::Database(err) => {
                tracing::error!(error = %err, "Database error");
                internal()
            }

            // --- Provider errors ---
            AppError::Provider(err) => match err {
                ProviderError::InvalidPayload(msg) | ProviderError::MalformedResult(msg) => {
                    (StatusCode::BAD_REQUEST, "INVALID_CALLBACK", msg.clone())
                }
                other => {
                    tracing::error!(error = %other, "Provider error");
                    (
                        StatusCode::BAD_GATEWAY,
                        "PROVIDER_ERROR",
                        "The generation provider returned an error".to_string(),
                    )
                }
            },
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
