//! Handlers for the `/generations` and `/short-links` resources.
//!
//! Submitting and inspecting generations requires authentication via
//! [`AuthAccount`]; short links are public so results can be shared.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use mvstudio_core::credits::OperationKind;
use mvstudio_core::error::CoreError;
use mvstudio_core::task::TaskState;
use mvstudio_core::types::Timestamp;
use mvstudio_db::models::task::GenerationTask;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::error::AppResult;
use crate::middleware::auth::AuthAccount;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct CreateGeneration {
    /// Operation kind name, e.g. `"video-fast-720"`.
    #[validate(length(min = 1, max = 64))]
    pub operation: String,
    /// Provider-specific request body. Must be a JSON object.
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Serialize)]
pub struct GenerationAccepted {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct FailureView {
    pub code: String,
    pub message: Option<String>,
}

/// Caller-facing view of a task. Provider job handles and receipts stay
/// internal.
#[derive(Debug, Serialize)]
pub struct GenerationView {
    pub task_id: String,
    pub state: TaskState,
    pub operation_kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureView>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<GenerationTask> for GenerationView {
    fn from(task: GenerationTask) -> Self {
        let failure = task.failure_code.map(|code| FailureView {
            code,
            message: task.failure_message,
        });
        Self {
            task_id: task.task_id,
            state: task.state,
            operation_kind: task.operation_kind,
            result_url: task.result_url,
            failure,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ShortLinkView {
    pub task_id: String,
    pub result_url: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/generations
///
/// Debit the caller and start a generation. Returns 202 with the task id;
/// the outcome is observed through [`get_generation`] or the short link.
pub async fn create_generation(
    auth: AuthAccount,
    State(state): State<AppState>,
    Json(input): Json<CreateGeneration>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;

    let task_id = state
        .orchestrator
        .request_generation(auth.account_id, input.operation.trim(), input.payload)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: GenerationAccepted { task_id },
        }),
    ))
}

/// GET /api/v1/generations/{task_id}
///
/// Tasks owned by other accounts are reported as not found.
pub async fn get_generation(
    auth: AuthAccount,
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<DataResponse<GenerationView>>> {
    let task = state.orchestrator.lookup(&task_id).await?;

    if task.account_id != auth.account_id {
        return Err(CoreError::NotFound {
            entity: "generation_task",
            id: task.task_id,
        }
        .into());
    }

    Ok(Json(DataResponse { data: task.into() }))
}

/// GET /api/v1/short-links/{task_id}
pub async fn resolve_short_link(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<DataResponse<ShortLinkView>>> {
    let result_url = state.orchestrator.resolve_short_link(&task_id).await?;

    Ok(Json(DataResponse {
        data: ShortLinkView {
            task_id: task_id.trim().to_string(),
            result_url,
        },
    }))
}
