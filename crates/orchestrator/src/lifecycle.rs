//! Terminal settlement shared by the poll loop, callbacks, and resume.
//!
//! A failed task is refunded and marked failed in one registry write. If
//! that write errors neither half is visible: the task stays unresolved and
//! the next tick retries. Settlement of one task is serialized in-process,
//! and the lock entry is released on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use mvstudio_core::error::CoreError;
use mvstudio_core::task::{FailureReason, Provider};
use mvstudio_db::models::task::{GenerationTask, TerminalWrite};
use mvstudio_providers::adapter::{AdapterSet, PollStatus, ProviderAdapter};
use mvstudio_providers::config::ProvidersConfig;
use mvstudio_providers::credential::CredentialSigner;
use mvstudio_providers::error::ProviderError;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::backoff::RetryPolicy;
use crate::error::OrchestratorError;
use crate::ledger::CreditLedger;
use crate::registry::TaskRegistry;

/// Everything a lifecycle worker needs, shared behind one `Arc`.
pub struct Lifecycle {
    pub ledger: Arc<dyn CreditLedger>,
    pub registry: Arc<dyn TaskRegistry>,
    pub adapters: AdapterSet,
    pub signer: CredentialSigner,
    pub providers: Arc<ProvidersConfig>,
    pub submit_retry: RetryPolicy,
    settle_locks: Arc<SettleLocks>,
}

type SettleLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Holds one task's settle lock. Dropping it unlocks, and removes the map
/// entry when no other settler is waiting on it.
struct SettleGuard {
    locks: Arc<SettleLocks>,
    task_id: String,
    lock: Arc<Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One count here, one in the map.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.task_id);
        }
    }
}

impl Lifecycle {
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        registry: Arc<dyn TaskRegistry>,
        adapters: AdapterSet,
        providers: Arc<ProvidersConfig>,
        submit_retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            registry,
            adapters,
            signer: CredentialSigner::new(Arc::clone(&providers)),
            providers,
            submit_retry,
            settle_locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn adapter(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>, CoreError> {
        self.adapters
            .get(provider)
            .ok_or_else(|| CoreError::Internal(format!("no adapter registered for {provider}")))
    }

    /// Apply a provider status to a task. `Pending` changes nothing.
    pub async fn settle(
        &self,
        task_id: &str,
        status: PollStatus,
    ) -> Result<Option<TerminalWrite>, OrchestratorError> {
        match status {
            PollStatus::Pending => Ok(None),
            PollStatus::Completed { raw } => self.settle_completed(task_id, &raw).await.map(Some),
            PollStatus::Failed { reason } => self
                .settle_failed(task_id, FailureReason::ProviderFailed(reason))
                .await
                .map(Some),
        }
    }

    /// Parse a completed result and record it. A result the adapter cannot
    /// decode fails the task with a refund.
    pub async fn settle_completed(
        &self,
        task_id: &str,
        raw: &Value,
    ) -> Result<TerminalWrite, OrchestratorError> {
        let _guard = self.settle_lock(task_id).await;

        let task = self.registry.lookup(task_id).await?;
        if task.state.is_terminal() {
            return Ok(TerminalWrite::AlreadyTerminal(task.state));
        }

        let adapter = self.adapter(task.provider)?;
        let write = match adapter.parse_result(raw) {
            Ok(url) => {
                let write = self.registry.record_completed(task_id, &url).await?;
                tracing::info!(
                    task_id,
                    provider = %task.provider,
                    operation = %task.operation_kind,
                    "Generation task completed",
                );
                write
            }
            Err(e) => {
                tracing::warn!(
                    task_id,
                    provider = %task.provider,
                    error = %e,
                    "Provider result could not be decoded",
                );
                self.fail_locked(&task, failure_reason(e)).await?
            }
        };
        Ok(write)
    }

    /// Refund and mark a task failed, unless it is already terminal.
    pub async fn settle_failed(
        &self,
        task_id: &str,
        reason: FailureReason,
    ) -> Result<TerminalWrite, OrchestratorError> {
        let _guard = self.settle_lock(task_id).await;

        let task = self.registry.lookup(task_id).await?;
        if task.state.is_terminal() {
            return Ok(TerminalWrite::AlreadyTerminal(task.state));
        }

        self.fail_locked(&task, reason).await
    }

    async fn fail_locked(
        &self,
        task: &GenerationTask,
        reason: FailureReason,
    ) -> Result<TerminalWrite, OrchestratorError> {
        let write = self
            .registry
            .fail_with_refund(&task.task_id, &reason)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    task_id = %task.task_id,
                    receipt_id = %task.receipt_id,
                    error = %e,
                    "Refund failed, leaving task unresolved",
                );
            })?;
        tracing::info!(
            task_id = %task.task_id,
            account_id = task.account_id,
            provider = %task.provider,
            failure = reason.code(),
            "Generation task failed",
        );
        Ok(write)
    }

    async fn settle_lock(&self, task_id: &str) -> SettleGuard {
        let lock = {
            let mut locks = self.settle_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(task_id.to_string()).or_default())
        };
        let held = Arc::clone(&lock).lock_owned().await;
        SettleGuard {
            locks: Arc::clone(&self.settle_locks),
            task_id: task_id.to_string(),
            lock,
            held: Some(held),
        }
    }

    #[cfg(test)]
    fn open_settle_locks(&self) -> usize {
        self.settle_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Failure reason for a provider error that ends a task.
pub fn failure_reason(err: ProviderError) -> FailureReason {
    match err {
        ProviderError::MalformedResult(msg) => FailureReason::MalformedResult(msg),
        ProviderError::Unavailable(msg) => FailureReason::ProviderUnavailable(msg),
        other => FailureReason::ProviderRejected(other.to_string()),
    }
}
