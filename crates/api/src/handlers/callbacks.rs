//! Provider callback receiver.
//!
//! Providers that push results call back with the shared token as a query
//! parameter. The body is decoded by the provider's adapter and settled
//! through the same idempotent path as polling, so duplicate or late
//! callbacks are harmless.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use mvstudio_core::error::CoreError;
use mvstudio_core::task::Provider;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub token: Option<String>,
}

/// POST /api/v1/callbacks/{provider}?token=
pub async fn provider_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
    Json(body): Json<Value>,
) -> AppResult<StatusCode> {
    match (&state.config.callback_token, query.token.as_deref()) {
        (Some(expected), Some(presented)) if expected == presented => {}
        _ => {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Invalid callback token".into(),
            )))
        }
    }

    let provider = provider.parse::<Provider>().map_err(|_| CoreError::NotFound {
        entity: "provider",
        id: provider.clone(),
    })?;

    let write = state.orchestrator.handle_callback(provider, &body).await?;
    tracing::debug!(provider = %provider, ?write, "Provider callback handled");

    Ok(StatusCode::NO_CONTENT)
}
