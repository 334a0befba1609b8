//! Task registry port: the single source of truth for task lifecycle.
//!
//! Terminal writes are idempotent. Writing `completed` or `failed` to a task
//! that is already terminal returns [`TerminalWrite::AlreadyTerminal`] and
//! changes nothing, so duplicate poll results and callbacks are harmless.
//! A failure and its refund commit together or not at all.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mvstudio_core::error::CoreError;
use mvstudio_core::task::{FailureReason, Provider, TaskState};
use mvstudio_db::models::task::{GenerationTask, NewTask, TerminalWrite};
use mvstudio_db::repositories::{ShortLinkRepo, TaskRepo};
use mvstudio_db::DbPool;
use tokio::sync::Mutex;

use crate::error::OrchestratorError;
use crate::ledger::CreditLedger;

#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Register a task in the `submitting` state.
    async fn create(&self, new: NewTask) -> Result<GenerationTask, OrchestratorError>;

    /// `submitting -> pending`, recording the provider job handle.
    async fn record_submitted(
        &self,
        task_id: &str,
        handle: &str,
    ) -> Result<GenerationTask, OrchestratorError>;

    /// Move to `completed` and upsert the short link.
    async fn record_completed(
        &self,
        task_id: &str,
        result_url: &str,
    ) -> Result<TerminalWrite, OrchestratorError>;

    /// Refund the task's debit and move it to `failed`, atomically. On
    /// error neither the refund nor the state change is visible.
    async fn fail_with_refund(
        &self,
        task_id: &str,
        reason: &FailureReason,
    ) -> Result<TerminalWrite, OrchestratorError>;

    /// Route a still-`submitting` task to another provider.
    async fn reassign_provider(
        &self,
        task_id: &str,
        provider: Provider,
    ) -> Result<GenerationTask, OrchestratorError>;

    async fn lookup(&self, task_id: &str) -> Result<GenerationTask, OrchestratorError>;

    async fn find_by_handle(
        &self,
        provider: Provider,
        handle: &str,
    ) -> Result<Option<GenerationTask>, OrchestratorError>;

    /// Final asset URL of a completed task.
    async fn resolve_short_link(&self, task_id: &str) -> Result<String, OrchestratorError>;

    /// Tasks still `submitting` or `pending`.
    async fn list_unresolved(&self) -> Result<Vec<GenerationTask>, OrchestratorError>;
}

fn task_not_found(task_id: &str) -> OrchestratorError {
    CoreError::NotFound {
        entity: "generation_task",
        id: task_id.to_string(),
    }
    .into()
}

fn not_submitting(task: &GenerationTask) -> OrchestratorError {
    CoreError::InvalidTransition {
        task_id: task.task_id.clone(),
        from: task.state.as_str(),
        to: TaskState::Submitting.as_str(),
    }
    .into()
}

fn short_link_not_found(task_id: &str) -> OrchestratorError {
    CoreError::NotFound {
        entity: "short_link",
        id: task_id.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgTaskRegistry {
    pool: DbPool,
}

impl PgTaskRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded terminal update touched no row.
    async fn terminal_miss(&self, task_id: &str) -> Result<TerminalWrite, OrchestratorError> {
        let task = self.lookup(task_id).await?;
        if task.state.is_terminal() {
            Ok(TerminalWrite::AlreadyTerminal(task.state))
        } else {
            Err(CoreError::Internal(format!(
                "terminal write on task {task_id} in state {} matched no row",
                task.state
            ))
            .into())
        }
    }
}

#[async_trait]
impl TaskRegistry for PgTaskRegistry {
    async fn create(&self, new: NewTask) -> Result<GenerationTask, OrchestratorError> {
        Ok(TaskRepo::create(&self.pool, &new).await?)
    }

    async fn record_submitted(
        &self,
        task_id: &str,
        handle: &str,
    ) -> Result<GenerationTask, OrchestratorError> {
        if let Some(task) = TaskRepo::record_submitted(&self.pool, task_id, handle).await? {
            return Ok(task);
        }
        let task = self.lookup(task_id).await?;
        task.state.check_transition(task_id, TaskState::Pending)?;
        Err(CoreError::Internal(format!("record_submitted on task {task_id} matched no row")).into())
    }

    async fn record_completed(
        &self,
        task_id: &str,
        result_url: &str,
    ) -> Result<TerminalWrite, OrchestratorError> {
        if TaskRepo::complete(&self.pool, task_id, result_url).await? {
            Ok(TerminalWrite::Applied)
        } else {
            self.terminal_miss(task_id).await
        }
    }

    async fn fail_with_refund(
        &self,
        task_id: &str,
        reason: &FailureReason,
    ) -> Result<TerminalWrite, OrchestratorError> {
        match TaskRepo::fail_with_refund(&self.pool, task_id, reason).await? {
            Some(refund) => {
                tracing::debug!(task_id, ?refund, "Task failed with refund");
                Ok(TerminalWrite::Applied)
            }
            None => self.terminal_miss(task_id).await,
        }
    }

    async fn reassign_provider(
        &self,
        task_id: &str,
        provider: Provider,
    ) -> Result<GenerationTask, OrchestratorError> {
        if let Some(task) = TaskRepo::reassign_provider(&self.pool, task_id, provider).await? {
            return Ok(task);
        }
        Err(not_submitting(&self.lookup(task_id).await?))
    }

    async fn lookup(&self, task_id: &str) -> Result<GenerationTask, OrchestratorError> {
        TaskRepo::find_by_id(&self.pool, task_id)
            .await?
            .ok_or_else(|| task_not_found(task_id))
    }

    async fn find_by_handle(
        &self,
        provider: Provider,
        handle: &str,
    ) -> Result<Option<GenerationTask>, OrchestratorError> {
        Ok(TaskRepo::find_by_handle(&self.pool, provider, handle).await?)
    }

    async fn resolve_short_link(&self, task_id: &str) -> Result<String, OrchestratorError> {
        ShortLinkRepo::find(&self.pool, task_id)
            .await?
            .map(|link| link.result_url)
            .ok_or_else(|| short_link_not_found(task_id))
    }

    async fn list_unresolved(&self) -> Result<Vec<GenerationTask>, OrchestratorError> {
        Ok(TaskRepo::list_unresolved(&self.pool).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryRegistryState {
    tasks: HashMap<String, GenerationTask>,
    /// Kept apart from `tasks` so links outlive any task bookkeeping.
    short_links: HashMap<String, String>,
}

/// Process-local registry. Tasks are lost on restart.
///
/// Refunds go through `ledger` while the registry lock is held, so no
/// reader ever sees an open task whose debit is already reversed.
pub struct MemoryTaskRegistry {
    ledger: Arc<dyn CreditLedger>,
    state: Mutex<MemoryRegistryState>,
}

impl MemoryTaskRegistry {
    pub fn new(ledger: Arc<dyn CreditLedger>) -> Self {
        Self {
            ledger,
            state: Mutex::new(MemoryRegistryState::default()),
        }
    }
}

#[async_trait]
impl TaskRegistry for MemoryTaskRegistry {
    async fn create(&self, new: NewTask) -> Result<GenerationTask, OrchestratorError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&new.task_id) {
            return Err(CoreError::Internal(format!("duplicate task id {}", new.task_id)).into());
        }
        let task = GenerationTask::submitting(new, Utc::now());
        state.tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    async fn record_submitted(
        &self,
        task_id: &str,
        handle: &str,
    ) -> Result<GenerationTask, OrchestratorError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| task_not_found(task_id))?;
        task.state.check_transition(task_id, TaskState::Pending)?;

        task.state = TaskState::Pending;
        task.provider_job_handle = Some(handle.to_string());
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn record_completed(
        &self,
        task_id: &str,
        result_url: &str,
    ) -> Result<TerminalWrite, OrchestratorError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| task_not_found(task_id))?;
        if task.state.is_terminal() {
            return Ok(TerminalWrite::AlreadyTerminal(task.state));
        }

        task.state = TaskState::Completed;
        task.result_url = Some(result_url.to_string());
        task.updated_at = Utc::now();
        state
            .short_links
            .insert(task_id.to_string(), result_url.to_string());
        Ok(TerminalWrite::Applied)
    }

    async fn fail_with_refund(
        &self,
        task_id: &str,
        reason: &FailureReason,
    ) -> Result<TerminalWrite, OrchestratorError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| task_not_found(task_id))?;
        if task.state.is_terminal() {
            return Ok(TerminalWrite::AlreadyTerminal(task.state));
        }

        let refund = self.ledger.refund(task.receipt_id).await?;
        task.state = TaskState::Failed;
        task.set_failure(reason);
        task.updated_at = Utc::now();
        tracing::debug!(task_id, ?refund, "Task failed with refund");
        Ok(TerminalWrite::Applied)
    }

    async fn reassign_provider(
        &self,
        task_id: &str,
        provider: Provider,
    ) -> Result<GenerationTask, OrchestratorError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| task_not_found(task_id))?;
        if task.state != TaskState::Submitting {
            return Err(not_submitting(task));
        }

        task.provider = provider;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn lookup(&self, task_id: &str) -> Result<GenerationTask, OrchestratorError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| task_not_found(task_id))
    }

    async fn find_by_handle(
        &self,
        provider: Provider,
        handle: &str,
    ) -> Result<Option<GenerationTask>, OrchestratorError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .find(|t| t.provider == provider && t.provider_job_handle.as_deref() == Some(handle))
            .cloned())
    }

    async fn resolve_short_link(&self, task_id: &str) -> Result<String, OrchestratorError> {
        let state = self.state.lock().await;
        state
            .short_links
            .get(task_id)
            .cloned()
            .ok_or_else(|| short_link_not_found(task_id))
    }

    async fn list_unresolved(&self) -> Result<Vec<GenerationTask>, OrchestratorError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}
