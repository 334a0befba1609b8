//! Per-task lifecycle worker.
//!
//! One Tokio task per generation: submit with bounded retry, then poll at
//! the provider's interval until the registry shows a terminal state or
//! the provider's wall-clock budget runs out. A provider that rejects the
//! submission or stays unavailable hands the task to the next fallback, if
//! any, under the same receipt. Cancellation (shutdown) stops the worker
//! without touching the task, so it can be resumed.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mvstudio_core::credits::OperationKind;
use mvstudio_core::task::{FailureReason, Provider, TaskState};
use mvstudio_providers::adapter::{ProviderAdapter, SubmitOutcome};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::{next_delay, retry_transient, RetryError};
use crate::error::OrchestratorError;
use crate::lifecycle::{failure_reason, Lifecycle};

/// Where a worker picks up the task.
pub enum WorkerStart {
    /// Fresh task: submit `payload`, then poll.
    Submit { payload: Value },
    /// Already accepted by the provider: poll `handle`.
    Poll { handle: String },
}

/// Result of retrying a registry write.
enum Persisted<T> {
    Done(T),
    GaveUp,
    Cancelled,
}

pub struct TaskWorker {
    lifecycle: Arc<Lifecycle>,
    task_id: String,
    kind: OperationKind,
    adapter: Arc<dyn ProviderAdapter>,
    fallbacks: VecDeque<Arc<dyn ProviderAdapter>>,
    poll_interval: Duration,
    deadline: Instant,
}

impl TaskWorker {
    /// `remaining` is what is left of the provider's wall-clock budget.
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        task_id: String,
        kind: OperationKind,
        adapter: Arc<dyn ProviderAdapter>,
        remaining: Duration,
    ) -> Self {
        let poll_interval = lifecycle.providers.settings(adapter.provider()).poll_interval;
        Self {
            lifecycle,
            task_id,
            kind,
            adapter,
            fallbacks: VecDeque::new(),
            poll_interval,
            deadline: Instant::now() + remaining,
        }
    }

    /// Providers to try, in order, if the current one cannot take the job.
    pub fn with_fallbacks(mut self, fallbacks: impl IntoIterator<Item = Arc<dyn ProviderAdapter>>) -> Self {
        self.fallbacks = fallbacks.into_iter().collect();
        self
    }

    fn provider(&self) -> Provider {
        self.adapter.provider()
    }

    /// Drive the task until it is terminal or `cancel` fires.
    pub async fn run(mut self, start: WorkerStart, cancel: CancellationToken) {
        let handle = match start {
            WorkerStart::Submit { payload } => match self.submit(&payload, &cancel).await {
                Some(handle) => handle,
                None => return,
            },
            WorkerStart::Poll { handle } => handle,
        };

        self.poll_until_terminal(&handle, &cancel).await;
    }

    /// Submit with retry, falling back through the chain. Returns the job
    /// handle if polling should follow.
    async fn submit(&mut self, payload: &Value, cancel: &CancellationToken) -> Option<String> {
        loop {
            let reason = match self.submit_current(payload, cancel).await {
                Ok(SubmitOutcome::Accepted { handle }) => {
                    return self.record_submission(handle, cancel).await;
                }
                Ok(SubmitOutcome::Completed { raw }) => {
                    self.record_sync_result(&raw, cancel).await;
                    return None;
                }
                Err(RetryError::Cancelled) => return None,
                Err(RetryError::Permanent(e)) => {
                    tracing::warn!(
                        task_id = %self.task_id,
                        provider = %self.provider(),
                        error = %e,
                        "Provider rejected submission",
                    );
                    failure_reason(e)
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    tracing::warn!(
                        task_id = %self.task_id,
                        provider = %self.provider(),
                        attempts,
                        error = %last,
                        "Provider unavailable, giving up",
                    );
                    FailureReason::ProviderUnavailable(last.to_string())
                }
            };

            match self.fall_back(cancel).await {
                Persisted::Done(true) => continue,
                Persisted::Cancelled => return None,
                Persisted::Done(false) | Persisted::GaveUp => {
                    self.fail_until_recorded(reason, cancel).await;
                    return None;
                }
            }
        }
    }

    async fn submit_current(
        &self,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Result<SubmitOutcome, RetryError> {
        let lc = &self.lifecycle;
        retry_transient(&lc.submit_retry, cancel, |attempt| async move {
            // Signed credentials are minted per request.
            let credential = lc
                .signer
                .credential_for(self.provider(), self.adapter.auth_style())?;
            tracing::debug!(
                task_id = %self.task_id,
                provider = %self.provider(),
                attempt,
                "Submitting generation",
            );
            self.adapter.submit(self.kind, payload, &credential).await
        })
        .await
    }

    /// Switch to the next fallback provider. `Done(false)` when none is left
    /// or the task is no longer waiting on a submission.
    async fn fall_back(&mut self, cancel: &CancellationToken) -> Persisted<bool> {
        let Some(next) = self.fallbacks.pop_front() else {
            return Persisted::Done(false);
        };
        let to = next.provider();
        let lc = Arc::clone(&self.lifecycle);
        let (registry, task_id) = (&lc.registry, self.task_id.as_str());

        let switched = self
            .persist(cancel, "reassign_provider", || async move {
                match registry.reassign_provider(task_id, to).await {
                    Ok(_) => Ok(true),
                    Err(e) => match registry.lookup(task_id).await {
                        Ok(task) if task.state != TaskState::Submitting => Ok(false),
                        Ok(task) if task.provider == to => Ok(true),
                        _ => Err(e),
                    },
                }
            })
            .await;

        if let Persisted::Done(true) = switched {
            tracing::warn!(
                task_id = %self.task_id,
                from = %self.provider(),
                to = %to,
                "Falling back to next provider",
            );
            self.poll_interval = lc.providers.settings(to).poll_interval;
            self.adapter = next;
        }
        switched
    }

    /// Persist the job handle. A job the registry never learns about cannot
    /// be polled, so giving up fails the task with a refund.
    async fn record_submission(&self, handle: String, cancel: &CancellationToken) -> Option<String> {
        let lc = &self.lifecycle;
        let (task_id, job) = (self.task_id.as_str(), handle.as_str());

        let recorded = self
            .persist(cancel, "record_submitted", || async move {
                match lc.registry.record_submitted(task_id, job).await {
                    Ok(_) => Ok(true),
                    Err(e) => match lc.registry.lookup(task_id).await {
                        // An earlier attempt landed after all.
                        Ok(task)
                            if task.state == TaskState::Pending
                                && task.provider_job_handle.as_deref() == Some(job) =>
                        {
                            Ok(true)
                        }
                        Ok(task) if task.state.is_terminal() => Ok(false),
                        _ => Err(e),
                    },
                }
            })
            .await;

        match recorded {
            Persisted::Done(true) => {
                tracing::info!(task_id, provider = %self.provider(), "Generation submitted");
                Some(handle)
            }
            Persisted::Done(false) | Persisted::Cancelled => None,
            Persisted::GaveUp => {
                self.fail_until_recorded(FailureReason::Timeout, cancel).await;
                None
            }
        }
    }

    async fn record_sync_result(&self, raw: &Value, cancel: &CancellationToken) {
        let lc = &self.lifecycle;
        let recorded = self
            .persist(cancel, "settle_completed", || lc.settle_completed(&self.task_id, raw))
            .await;
        if let Persisted::GaveUp = recorded {
            self.fail_until_recorded(FailureReason::Timeout, cancel).await;
        }
    }

    /// Retry a registry write with backoff until it lands, the deadline
    /// passes, or `cancel` fires.
    async fn persist<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        write: &'static str,
        mut op: F,
    ) -> Persisted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let policy = &self.lifecycle.submit_retry;
        let mut delay = policy.initial_delay;
        loop {
            match op().await {
                Ok(value) => return Persisted::Done(value),
                Err(e) if Instant::now() >= self.deadline => {
                    tracing::error!(
                        task_id = %self.task_id,
                        write,
                        error = %e,
                        "Registry write failed past the deadline, giving up",
                    );
                    return Persisted::GaveUp;
                }
                Err(e) => tracing::warn!(
                    task_id = %self.task_id,
                    write,
                    error = %e,
                    "Registry write failed, retrying",
                ),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Persisted::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, policy);
        }
    }

    /// Keep trying to settle a failure until the refund and the failed write
    /// both land.
    async fn fail_until_recorded(&self, reason: FailureReason, cancel: &CancellationToken) {
        loop {
            match self
                .lifecycle
                .settle_failed(&self.task_id, reason.clone())
                .await
            {
                Ok(_) => return,
                Err(e) => tracing::error!(
                    task_id = %self.task_id,
                    error = %e,
                    "Failed to settle task failure, retrying",
                ),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn poll_until_terminal(&self, handle: &str, cancel: &CancellationToken) {
        loop {
            let now = Instant::now();
            let wait = if now >= self.deadline {
                self.poll_interval
            } else {
                self.poll_interval.min(self.deadline - now)
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(task_id = %self.task_id, "Lifecycle worker cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if Instant::now() >= self.deadline {
                match self
                    .lifecycle
                    .settle_failed(&self.task_id, FailureReason::Timeout)
                    .await
                {
                    Ok(_) => {
                        tracing::warn!(
                            task_id = %self.task_id,
                            provider = %self.provider(),
                            "Generation task timed out",
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::error!(task_id = %self.task_id, error = %e, "Timeout settlement failed");
                        continue;
                    }
                }
            }

            if self.poll_once(handle).await {
                return;
            }
        }
    }

    /// One poll cycle. Returns `true` once the task is terminal.
    async fn poll_once(&self, handle: &str) -> bool {
        let lc = &self.lifecycle;

        // A callback may already have settled the task.
        match lc.registry.lookup(&self.task_id).await {
            Ok(task) if task.state.is_terminal() => return true,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(task_id = %self.task_id, error = %e, "Task lookup failed");
                return false;
            }
        }

        let status = match lc
            .signer
            .credential_for(self.provider(), self.adapter.auth_style())
        {
            Ok(credential) => self.adapter.poll(handle, &credential).await,
            Err(e) => Err(e),
        };

        match status {
            Ok(status) if !status.is_terminal() => false,
            Ok(status) => match lc.settle(&self.task_id, status).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(task_id = %self.task_id, error = %e, "Settlement failed");
                    false
                }
            },
            Err(e) => {
                // Poll errors are retried until the budget runs out.
                tracing::warn!(
                    task_id = %self.task_id,
                    provider = %self.provider(),
                    error = %e,
                    "Poll failed",
                );
                false
            }
        }
    }
}
