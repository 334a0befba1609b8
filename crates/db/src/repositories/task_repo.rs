//! Repository for the `generation_tasks` table.
//!
//! Every state change is a guarded `UPDATE ... WHERE state IN (...)`, so the
//! database itself refuses edges that are not in the lifecycle graph.
//! Callers distinguish "not found" from "wrong state" with a follow-up read.

use mvstudio_core::task::{FailureReason, Provider, TaskState};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::credit::RefundOutcome;
use crate::models::task::{GenerationTask, NewTask};
use crate::repositories::{CreditRepo, ShortLinkRepo};

/// Column list for `generation_tasks` queries.
const COLUMNS: &str = "\
    task_id, account_id, provider, operation_kind, provider_job_handle, \
    state, result_url, receipt_id, failure_code, failure_message, \
    created_at, updated_at";

pub struct TaskRepo;

impl TaskRepo {
    /// Insert a task in the `submitting` state.
    pub async fn create(pool: &PgPool, input: &NewTask) -> Result<GenerationTask, sqlx::Error> {
        let query = format!(
            "INSERT INTO generation_tasks \
                 (task_id, account_id, provider, operation_kind, state, receipt_id) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(&input.task_id)
            .bind(input.account_id)
            .bind(input.provider.as_str())
            .bind(input.operation_kind.as_str())
            .bind(TaskState::Submitting.as_str())
            .bind(input.receipt_id)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        task_id: &str,
    ) -> Result<Option<GenerationTask>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM generation_tasks WHERE task_id = $1");
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(task_id)
            .fetch_optional(pool)
            .await
    }

    /// Find the task a provider job handle belongs to (callback path).
    pub async fn find_by_handle(
        pool: &PgPool,
        provider: Provider,
        handle: &str,
    ) -> Result<Option<GenerationTask>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_tasks \
             WHERE provider = $1 AND provider_job_handle = $2"
        );
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(provider.as_str())
            .bind(handle)
            .fetch_optional(pool)
            .await
    }

    /// `submitting -> pending`. Returns `None` if the task was not submitting.
    pub async fn record_submitted(
        pool: &PgPool,
        task_id: &str,
        handle: &str,
    ) -> Result<Option<GenerationTask>, sqlx::Error> {
        let query = format!(
            "UPDATE generation_tasks \
             SET state = $2, provider_job_handle = $3, updated_at = NOW() \
             WHERE task_id = $1 AND state = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(task_id)
            .bind(TaskState::Pending.as_str())
            .bind(handle)
            .bind(TaskState::Submitting.as_str())
            .fetch_optional(pool)
            .await
    }

    /// Move a non-terminal task to `completed` and upsert its short link in
    /// the same transaction.
    ///
    /// Returns `false` if the task was missing or already terminal.
    pub async fn complete(
        pool: &PgPool,
        task_id: &str,
        result_url: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE generation_tasks \
             SET state = $2, result_url = $3, updated_at = NOW() \
             WHERE task_id = $1 AND state IN ($4, $5)",
        )
        .bind(task_id)
        .bind(TaskState::Completed.as_str())
        .bind(result_url)
        .bind(TaskState::Submitting.as_str())
        .bind(TaskState::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        ShortLinkRepo::upsert(&mut *tx, task_id, result_url).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Refund a non-terminal task's receipt and move it to `failed`, in one
    /// transaction.
    ///
    /// The task row is locked first, so a concurrent completion either lands
    /// before (and this returns `None`) or waits and then finds the task
    /// terminal. Returns `None` if the task was missing or already terminal.
    pub async fn fail_with_refund(
        pool: &PgPool,
        task_id: &str,
        reason: &FailureReason,
    ) -> Result<Option<RefundOutcome>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let receipt_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT receipt_id FROM generation_tasks \
             WHERE task_id = $1 AND state IN ($2, $3) \
             FOR UPDATE",
        )
        .bind(task_id)
        .bind(TaskState::Submitting.as_str())
        .bind(TaskState::Pending.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(receipt_id) = receipt_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let refund = CreditRepo::refund_in(&mut *tx, receipt_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        sqlx::query(
            "UPDATE generation_tasks \
             SET state = $2, failure_code = $3, failure_message = $4, updated_at = NOW() \
             WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(TaskState::Failed.as_str())
        .bind(reason.code())
        .bind(reason.message())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(refund))
    }

    /// Point a `submitting` task at another provider before a fallback
    /// submit. Returns `None` if the task was not submitting.
    pub async fn reassign_provider(
        pool: &PgPool,
        task_id: &str,
        provider: Provider,
    ) -> Result<Option<GenerationTask>, sqlx::Error> {
        let query = format!(
            "UPDATE generation_tasks \
             SET provider = $2, updated_at = NOW() \
             WHERE task_id = $1 AND state = $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(task_id)
            .bind(provider.as_str())
            .bind(TaskState::Submitting.as_str())
            .fetch_optional(pool)
            .await
    }

    /// Tasks still `submitting` or `pending`, oldest first.
    pub async fn list_unresolved(pool: &PgPool) -> Result<Vec<GenerationTask>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_tasks \
             WHERE state IN ($1, $2) \
             ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, GenerationTask>(&query)
            .bind(TaskState::Submitting.as_str())
            .bind(TaskState::Pending.as_str())
            .fetch_all(pool)
            .await
    }
}
