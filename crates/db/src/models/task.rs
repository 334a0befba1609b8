//! Generation task entity and DTOs.

use mvstudio_core::credits::OperationKind;
use mvstudio_core::task::{FailureReason, Provider, TaskState};
use mvstudio_core::types::{AccountId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A row from the `generation_tasks` table.
///
/// The provider job handle and the debit receipt are internal; neither is
/// ever serialized to callers.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationTask {
    pub task_id: String,
    pub account_id: AccountId,
    #[sqlx(try_from = "String")]
    pub provider: Provider,
    #[sqlx(try_from = "String")]
    pub operation_kind: OperationKind,
    #[serde(skip_serializing)]
    pub provider_job_handle: Option<String>,
    #[sqlx(try_from = "String")]
    pub state: TaskState,
    pub result_url: Option<String>,
    #[serde(skip_serializing)]
    pub receipt_id: Uuid,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Input for registering a freshly debited task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub account_id: AccountId,
    pub provider: Provider,
    pub operation_kind: OperationKind,
    pub receipt_id: Uuid,
}

/// Effect of a terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalWrite {
    /// The task moved into the requested terminal state.
    Applied,
    /// The task was already terminal; the write was ignored.
    AlreadyTerminal(TaskState),
}

impl GenerationTask {
    /// Build an in-memory task in the `submitting` state.
    pub fn submitting(new: NewTask, now: Timestamp) -> Self {
        Self {
            task_id: new.task_id,
            account_id: new.account_id,
            provider: new.provider,
            operation_kind: new.operation_kind,
            provider_job_handle: None,
            state: TaskState::Submitting,
            result_url: None,
            receipt_id: new.receipt_id,
            failure_code: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the failure reason on an in-memory task.
    pub fn set_failure(&mut self, reason: &FailureReason) {
        self.failure_code = Some(reason.code().to_string());
        self.failure_message = Some(reason.message());
    }
}
