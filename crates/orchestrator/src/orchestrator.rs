//! The generation orchestrator.
//!
//! `request_generation` does every check that can fail synchronously
//! (unknown kind, no route, missing credential, insufficient credits)
//! before any side effect, then debits, registers the task, hands it to a
//! background [`TaskWorker`], and returns the opaque task id. The task is
//! registered under the first usable provider of its route; the remaining
//! usable ones become the worker's fallbacks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mvstudio_core::credits::OperationKind;
use mvstudio_core::error::CoreError;
use mvstudio_core::ids::{new_task_id, normalize_task_id};
use mvstudio_core::task::{FailureReason, Provider, TaskState};
use mvstudio_core::types::{AccountId, Credits};
use mvstudio_db::models::credit::CreditTransaction;
use mvstudio_db::models::task::{GenerationTask, NewTask, TerminalWrite};
use mvstudio_providers::adapter::{AdapterSet, ProviderAdapter};
use mvstudio_providers::config::ProvidersConfig;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::ledger::CreditLedger;
use crate::lifecycle::Lifecycle;
use crate::registry::TaskRegistry;
use crate::routing::RoutingTable;
use crate::worker::{TaskWorker, WorkerStart};

/// Outcome of [`Orchestrator::resume_unresolved`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    /// Pending tasks handed back to a poll worker.
    pub resumed: usize,
    /// Tasks whose submission outcome was unknown, failed and refunded.
    pub interrupted: usize,
    /// Tasks that could not be resumed this time. They stay unresolved.
    pub failed: usize,
}

pub struct Orchestrator {
    lifecycle: Arc<Lifecycle>,
    routes: RoutingTable,
    config: OrchestratorConfig,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        registry: Arc<dyn TaskRegistry>,
        adapters: AdapterSet,
        providers: Arc<ProvidersConfig>,
        routes: RoutingTable,
        config: OrchestratorConfig,
    ) -> Self {
        let lifecycle = Lifecycle::new(
            ledger,
            registry,
            adapters,
            providers,
            config.submit_retry.clone(),
        );
        Self {
            lifecycle: Arc::new(lifecycle),
            routes,
            config,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Debit, register, and start a generation. Returns the task id.
    pub async fn request_generation(
        &self,
        account_id: AccountId,
        operation: &str,
        payload: Value,
    ) -> Result<String, OrchestratorError> {
        let lc = &self.lifecycle;

        let (kind, cost) = lc.ledger.costs().resolve(operation)?;
        let mut candidates = self.candidates(kind)?.into_iter();
        let Some(adapter) = candidates.next() else {
            return Err(CoreError::UnroutableOperation(kind.to_string()).into());
        };
        let provider = adapter.provider();
        if !payload.is_object() {
            return Err(CoreError::Validation("payload must be a JSON object".into()).into());
        }

        let receipt = lc.ledger.debit(account_id, kind).await?;

        let task_id = new_task_id();
        let new_task = NewTask {
            task_id: task_id.clone(),
            account_id,
            provider,
            operation_kind: kind,
            receipt_id: receipt.receipt_id,
        };
        if let Err(e) = lc.registry.create(new_task).await {
            // No task exists to carry the refund later.
            if let Err(refund_err) = lc.ledger.refund(receipt.receipt_id).await {
                tracing::error!(
                    account_id,
                    receipt_id = %receipt.receipt_id,
                    error = %refund_err,
                    "Refund after failed task registration failed",
                );
            }
            return Err(e);
        }

        tracing::info!(
            task_id = %task_id,
            account_id,
            operation = %kind,
            provider = %provider,
            cost,
            balance_after = receipt.balance_after,
            "Generation task created",
        );

        let worker = TaskWorker::new(
            Arc::clone(lc),
            task_id.clone(),
            kind,
            adapter,
            lc.providers.settings(provider).max_wait,
        )
        .with_fallbacks(candidates);
        self.tracker
            .spawn(worker.run(WorkerStart::Submit { payload }, self.cancel.child_token()));

        Ok(task_id)
    }

    /// Adapters that can serve `kind` right now, in route order.
    ///
    /// Providers that do not support the kind are skipped. If every
    /// supporting provider lacks credentials the first of them is reported
    /// as `MissingCredential`.
    fn candidates(&self, kind: OperationKind) -> Result<Vec<Arc<dyn ProviderAdapter>>, CoreError> {
        let lc = &self.lifecycle;
        let mut usable = Vec::new();
        let mut unconfigured = None;

        for &provider in self.routes.chain(kind)? {
            let adapter = lc.adapter(provider)?;
            if !adapter.supports(kind) {
                continue;
            }
            if lc.signer.ensure_configured(provider, adapter.auth_style()).is_err() {
                unconfigured.get_or_insert(provider);
                continue;
            }
            usable.push(adapter);
        }

        match (usable.is_empty(), unconfigured) {
            (true, Some(provider)) => Err(CoreError::MissingCredential(provider.to_string())),
            (true, None) => Err(CoreError::UnroutableOperation(kind.to_string())),
            (false, _) => Ok(usable),
        }
    }

    pub async fn lookup(&self, task_id: &str) -> Result<GenerationTask, OrchestratorError> {
        let task_id = normalize_task_id(task_id)?;
        self.lifecycle.registry.lookup(task_id).await
    }

    pub async fn resolve_short_link(&self, task_id: &str) -> Result<String, OrchestratorError> {
        let task_id = normalize_task_id(task_id)?;
        self.lifecycle.registry.resolve_short_link(task_id).await
    }

    pub async fn balance(&self, account_id: AccountId) -> Result<Credits, OrchestratorError> {
        self.lifecycle.ledger.balance(account_id).await
    }

    pub async fn grant(
        &self,
        account_id: AccountId,
        amount: Credits,
    ) -> Result<Credits, OrchestratorError> {
        let balance = self.lifecycle.ledger.grant(account_id, amount).await?;
        tracing::info!(account_id, amount, balance, "Credits granted");
        Ok(balance)
    }

    /// Ledger history for an account, newest first.
    pub async fn transactions(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, OrchestratorError> {
        self.lifecycle
            .ledger
            .transactions(account_id, limit, offset)
            .await
    }

    /// Apply a provider-pushed status update.
    ///
    /// Progress-only callbacks return `Ok(None)`. Callbacks for a task that
    /// is already terminal are accepted and ignored.
    pub async fn handle_callback(
        &self,
        provider: Provider,
        body: &Value,
    ) -> Result<Option<TerminalWrite>, OrchestratorError> {
        let lc = &self.lifecycle;
        let adapter = lc.adapter(provider)?;

        let Some(notice) = adapter.parse_callback(body)? else {
            tracing::debug!(provider = %provider, "Ignoring progress callback");
            return Ok(None);
        };

        let task = lc
            .registry
            .find_by_handle(provider, &notice.handle)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "generation_task",
                id: format!("{provider}:{}", notice.handle),
            })?;

        tracing::info!(task_id = %task.task_id, provider = %provider, "Provider callback received");
        lc.settle(&task.task_id, notice.status).await
    }

    /// Re-attach work left behind by a previous process.
    ///
    /// `pending` tasks get a poll worker with whatever remains of their
    /// budget. `submitting` tasks may or may not have reached the provider;
    /// they are failed as interrupted and refunded. A task that cannot be
    /// handled is logged, counted as failed, and left for the next start.
    pub async fn resume_unresolved(&self) -> Result<ResumeSummary, OrchestratorError> {
        let mut summary = ResumeSummary::default();

        for task in self.lifecycle.registry.list_unresolved().await? {
            let task_id = task.task_id.clone();
            if let Err(e) = self.resume_one(task, &mut summary).await {
                tracing::error!(task_id = %task_id, error = %e, "Failed to resume generation task");
                summary.failed += 1;
            }
        }

        if summary != ResumeSummary::default() {
            tracing::info!(
                resumed = summary.resumed,
                interrupted = summary.interrupted,
                failed = summary.failed,
                "Resumed unresolved generation tasks",
            );
        }
        Ok(summary)
    }

    async fn resume_one(
        &self,
        task: GenerationTask,
        summary: &mut ResumeSummary,
    ) -> Result<(), OrchestratorError> {
        let lc = &self.lifecycle;
        match (task.state, task.provider_job_handle) {
            (TaskState::Pending, Some(handle)) => {
                let adapter = lc.adapter(task.provider)?;
                let max_wait = lc.providers.settings(task.provider).max_wait;
                let elapsed = (Utc::now() - task.created_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let worker = TaskWorker::new(
                    Arc::clone(lc),
                    task.task_id,
                    task.operation_kind,
                    adapter,
                    max_wait.saturating_sub(elapsed),
                );
                self.tracker
                    .spawn(worker.run(WorkerStart::Poll { handle }, self.cancel.child_token()));
                summary.resumed += 1;
            }
            _ => {
                lc.settle_failed(&task.task_id, FailureReason::Interrupted)
                    .await?;
                summary.interrupted += 1;
            }
        }
        Ok(())
    }

    /// Number of lifecycle workers currently running.
    pub fn active_workers(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every running worker has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel all workers and wait for them, up to the configured grace.
    ///
    /// Unresolved tasks stay as they are and are picked up by
    /// [`Orchestrator::resume_unresolved`] on the next start.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Lifecycle workers did not stop within the shutdown grace period",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use mvstudio_core::task::AuthStyle;
    use mvstudio_providers::adapter::{
        first_url, CallbackNotice, PollStatus, ProviderAdapter, SubmitOutcome,
    };
    use mvstudio_providers::config::{CredentialSource, ProviderSettings};
    use mvstudio_providers::credential::ProviderCredential;
    use mvstudio_providers::error::ProviderError;
    use serde_json::json;

    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::ledger::MemoryCreditLedger;
    use crate::registry::MemoryTaskRegistry;

    const ACCOUNT: AccountId = 42;

    /// Scripted adapter: submit and poll results are popped from queues;
    /// an empty poll queue means "still pending".
    struct ScriptedAdapter {
        provider: Provider,
        submits: StdMutex<VecDeque<Result<SubmitOutcome, ProviderError>>>,
        polls: StdMutex<VecDeque<Result<PollStatus, ProviderError>>>,
        submit_calls: AtomicUsize,
        poll_calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(provider: Provider) -> Self {
            Self {
                provider,
                submits: StdMutex::new(VecDeque::new()),
                polls: StdMutex::new(VecDeque::new()),
                submit_calls: AtomicUsize::new(0),
                poll_calls: AtomicUsize::new(0),
            }
        }

        fn on_submit(self, result: Result<SubmitOutcome, ProviderError>) -> Self {
            self.submits.lock().unwrap().push_back(result);
            self
        }

        fn on_poll(self, result: Result<PollStatus, ProviderError>) -> Self {
            self.polls.lock().unwrap().push_back(result);
            self
        }

        fn submit_calls(&self) -> usize {
            self.submit_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn auth_style(&self) -> AuthStyle {
            AuthStyle::StaticBearer
        }

        fn supports(&self, _kind: OperationKind) -> bool {
            true
        }

        async fn submit(
            &self,
            _kind: OperationKind,
            _payload: &Value,
            _credential: &ProviderCredential,
        ) -> Result<SubmitOutcome, ProviderError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            self.submits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(SubmitOutcome::Accepted { handle: "h1".into() }))
        }

        async fn poll(
            &self,
            _handle: &str,
            _credential: &ProviderCredential,
        ) -> Result<PollStatus, ProviderError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PollStatus::Pending))
        }

        fn parse_result(&self, raw: &Value) -> Result<String, ProviderError> {
            first_url(raw, &["/url"])
        }

        fn parse_callback(&self, body: &Value) -> Result<Option<CallbackNotice>, ProviderError> {
            let handle = body["handle"].as_str().unwrap_or_default().to_string();
            Ok(Some(CallbackNotice {
                handle,
                status: PollStatus::Completed { raw: body["result"].clone() },
            }))
        }
    }

    /// Delegates to a memory registry, failing the next N calls of selected
    /// writes with a database error.
    struct FaultyRegistry {
        inner: Arc<MemoryTaskRegistry>,
        submitted_faults: AtomicUsize,
        completed_faults: AtomicUsize,
        failed_faults: AtomicUsize,
    }

    impl FaultyRegistry {
        fn new(inner: Arc<MemoryTaskRegistry>) -> Self {
            Self {
                inner,
                submitted_faults: AtomicUsize::new(0),
                completed_faults: AtomicUsize::new(0),
                failed_faults: AtomicUsize::new(0),
            }
        }

        fn trip(counter: &AtomicUsize) -> Result<(), OrchestratorError> {
            match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
                Ok(_) => Err(sqlx::Error::PoolTimedOut.into()),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl TaskRegistry for FaultyRegistry {
        async fn create(&self, task: NewTask) -> Result<GenerationTask, OrchestratorError> {
            self.inner.create(task).await
        }

        async fn record_submitted(
            &self,
            task_id: &str,
            handle: &str,
        ) -> Result<GenerationTask, OrchestratorError> {
            Self::trip(&self.submitted_faults)?;
            self.inner.record_submitted(task_id, handle).await
        }

        async fn record_completed(
            &self,
            task_id: &str,
            result_url: &str,
        ) -> Result<TerminalWrite, OrchestratorError> {
            Self::trip(&self.completed_faults)?;
            self.inner.record_completed(task_id, result_url).await
        }

        async fn fail_with_refund(
            &self,
            task_id: &str,
            reason: &FailureReason,
        ) -> Result<TerminalWrite, OrchestratorError> {
            Self::trip(&self.failed_faults)?;
            self.inner.fail_with_refund(task_id, reason).await
        }

        async fn reassign_provider(
            &self,
            task_id: &str,
            provider: Provider,
        ) -> Result<GenerationTask, OrchestratorError> {
            self.inner.reassign_provider(task_id, provider).await
        }

        async fn lookup(&self, task_id: &str) -> Result<GenerationTask, OrchestratorError> {
            self.inner.lookup(task_id).await
        }

        async fn find_by_handle(
            &self,
            provider: Provider,
            handle: &str,
        ) -> Result<Option<GenerationTask>, OrchestratorError> {
            self.inner.find_by_handle(provider, handle).await
        }

        async fn resolve_short_link(&self, task_id: &str) -> Result<String, OrchestratorError> {
            self.inner.resolve_short_link(task_id).await
        }

        async fn list_unresolved(&self) -> Result<Vec<GenerationTask>, OrchestratorError> {
            self.inner.list_unresolved().await
        }
    }

    fn settings(key: Option<&str>, max_wait: Duration) -> ProviderSettings {
        let mut settings = ProviderSettings::new(
            "http://unused.invalid",
            CredentialSource::Static { key: key.map(String::from) },
        );
        settings.poll_interval = Duration::from_millis(5);
        settings.max_wait = max_wait;
        settings
    }

    fn providers(max_wait: Duration, fal_key: Option<&str>) -> Arc<ProvidersConfig> {
        Arc::new(ProvidersConfig {
            kling: settings(Some("k"), max_wait),
            suno: settings(Some("s"), max_wait),
            fal: settings(fal_key, max_wait),
            comet: settings(Some("c"), max_wait),
            suno_callback_url: None,
            fal_3d_model: "fal-ai/test".into(),
        })
    }

    struct Harness {
        orchestrator: Orchestrator,
        ledger: Arc<MemoryCreditLedger>,
        registry: Arc<MemoryTaskRegistry>,
        faults: Arc<FaultyRegistry>,
        adapter: Arc<ScriptedAdapter>,
    }

    /// Every routable kind goes to the scripted adapter's provider.
    async fn harness(adapter: ScriptedAdapter, balance: Credits, max_wait: Duration) -> Harness {
        let provider = adapter.provider;
        let routes = OperationKind::ALL
            .into_iter()
            .filter(|k| !matches!(k, OperationKind::Analysis | OperationKind::AudioAnalysis))
            .fold(RoutingTable::empty(), |table, kind| table.with_route(kind, provider));
        build(vec![adapter], routes, providers(max_wait, None), balance).await
    }

    /// The first adapter is `adapters[0]`; every adapter is registered.
    async fn build(
        adapters: Vec<ScriptedAdapter>,
        routes: RoutingTable,
        providers: Arc<ProvidersConfig>,
        balance: Credits,
    ) -> Harness {
        let ledger = Arc::new(MemoryCreditLedger::default());
        if balance > 0 {
            ledger.grant(ACCOUNT, balance).await.unwrap();
        }
        let registry = Arc::new(MemoryTaskRegistry::new(ledger.clone()));
        let faults = Arc::new(FaultyRegistry::new(registry.clone()));

        let adapters: Vec<Arc<ScriptedAdapter>> = adapters.into_iter().map(Arc::new).collect();
        let mut set = AdapterSet::new();
        for adapter in &adapters {
            set.register(adapter.clone());
        }

        let config = OrchestratorConfig {
            submit_retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                multiplier: 2.0,
            },
            shutdown_grace: Duration::from_secs(1),
        };

        let orchestrator = Orchestrator::new(
            ledger.clone(),
            faults.clone(),
            set,
            providers,
            routes,
            config,
        );
        Harness {
            orchestrator,
            ledger,
            registry,
            faults,
            adapter: adapters[0].clone(),
        }
    }

    const BUDGET: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn completed_generation_resolves_and_keeps_debit() {
        let adapter = ScriptedAdapter::new(Provider::Comet)
            .on_poll(Ok(PollStatus::Pending))
            .on_poll(Ok(PollStatus::Completed { raw: json!({ "url": "https://cdn/x.png" }) }));
        let h = harness(adapter, 10, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "image-generation", json!({ "prompt": "x" }))
            .await
            .unwrap();
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 2);

        h.orchestrator.drain().await;

        let task = h.orchestrator.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result_url.as_deref(), Some("https://cdn/x.png"));
        assert_eq!(
            h.orchestrator.resolve_short_link(&task_id).await.unwrap(),
            "https://cdn/x.png"
        );
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejected_submission_fails_and_refunds() {
        let adapter = ScriptedAdapter::new(Provider::Comet).on_submit(Err(ProviderError::Rejected {
            status: 400,
            message: "bad prompt".into(),
        }));
        let h = harness(adapter, 10, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "image-generation", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.failure_code.as_deref(), Some("provider_rejected"));
        assert_eq!(h.adapter.submit_calls(), 1);
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 10);
        assert_matches!(
            h.orchestrator.resolve_short_link(&task_id).await,
            Err(OrchestratorError::Core(CoreError::NotFound { .. }))
        );
    }

    #[tokio::test]
    async fn insufficient_credits_creates_nothing() {
        let h = harness(ScriptedAdapter::new(Provider::Comet), 3, BUDGET).await;

        assert_matches!(
            h.orchestrator
                .request_generation(ACCOUNT, "avatar", json!({}))
                .await,
            Err(OrchestratorError::Core(CoreError::InsufficientCredits { required: 10, available: 3 }))
        );
        h.orchestrator.drain().await;

        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 3);
        assert_eq!(h.adapter.submit_calls(), 0);
        assert!(h.registry.list_unresolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn synchronous_errors_precede_any_side_effect() {
        let h = harness(ScriptedAdapter::new(Provider::Fal), 100, BUDGET).await;

        assert_matches!(
            h.orchestrator.request_generation(ACCOUNT, "hologram", json!({})).await,
            Err(OrchestratorError::Core(CoreError::UnknownOperation(_)))
        );
        assert_matches!(
            h.orchestrator.request_generation(ACCOUNT, "analysis", json!({})).await,
            Err(OrchestratorError::Core(CoreError::UnroutableOperation(_)))
        );
        // fal has no key configured in this harness.
        assert_matches!(
            h.orchestrator.request_generation(ACCOUNT, "3d-conversion", json!({})).await,
            Err(OrchestratorError::Core(CoreError::MissingCredential(ref p))) if p == "fal"
        );

        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 100);
        assert_eq!(h.adapter.submit_calls(), 0);
    }

    #[tokio::test]
    async fn transient_submit_failures_are_retried() {
        let adapter = ScriptedAdapter::new(Provider::Kling)
            .on_submit(Err(ProviderError::Unavailable("503".into())))
            .on_submit(Err(ProviderError::Unavailable("503".into())))
            .on_submit(Ok(SubmitOutcome::Accepted { handle: "h-ok".into() }))
            .on_poll(Ok(PollStatus::Completed { raw: json!({ "url": "https://cdn/v.mp4" }) }));
        let h = harness(adapter, 50, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        assert_eq!(h.adapter.submit_calls(), 3);
        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.provider_job_handle.as_deref(), Some("h-ok"));
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 35);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_refund() {
        let adapter = ScriptedAdapter::new(Provider::Kling)
            .on_submit(Err(ProviderError::Unavailable("503".into())))
            .on_submit(Err(ProviderError::Unavailable("503".into())))
            .on_submit(Err(ProviderError::Unavailable("503".into())));
        let h = harness(adapter, 50, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        assert_eq!(h.adapter.submit_calls(), 3);
        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.failure_code.as_deref(), Some("provider_unavailable"));
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn provider_failure_refunds_exactly_once() {
        let adapter = ScriptedAdapter::new(Provider::Kling).on_poll(Ok(PollStatus::Failed {
            reason: "content policy".into(),
        }));
        let h = harness(adapter, 20, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "storyboard", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.failure_message.as_deref(), Some("content policy"));
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 20);

        // A duplicate failure notification changes nothing.
        let write = h
            .orchestrator
            .lifecycle
            .settle_failed(&task_id, FailureReason::ProviderFailed("again".into()))
            .await
            .unwrap();
        assert_eq!(write, TerminalWrite::AlreadyTerminal(TaskState::Failed));
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn malformed_result_fails_and_refunds() {
        let adapter = ScriptedAdapter::new(Provider::Kling)
            .on_poll(Ok(PollStatus::Completed { raw: json!({ "unexpected": true }) }));
        let h = harness(adapter, 20, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "remix-video", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.failure_code.as_deref(), Some("malformed_result"));
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn never_resolving_task_times_out_with_refund() {
        let h = harness(ScriptedAdapter::new(Provider::Suno), 12, Duration::from_millis(40)).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "music", json!({}))
            .await
            .unwrap();
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 0);
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.failure_code.as_deref(), Some("timeout"));
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn synchronous_provider_completes_without_polling() {
        let adapter = ScriptedAdapter::new(Provider::Comet).on_submit(Ok(SubmitOutcome::Completed {
            raw: json!({ "url": "https://cdn/s.png" }),
        }));
        let h = harness(adapter, 5, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "sticker", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        assert_eq!(
            h.orchestrator.resolve_short_link(&task_id).await.unwrap(),
            "https://cdn/s.png"
        );
        assert_eq!(h.adapter.poll_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn callback_settles_task_and_duplicates_are_ignored() {
        let adapter = ScriptedAdapter::new(Provider::Suno)
            .on_submit(Ok(SubmitOutcome::Accepted { handle: "cb-1".into() }));
        let h = harness(adapter, 12, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "music", json!({}))
            .await
            .unwrap();

        // Wait for the submit to land.
        for _ in 0..200 {
            if h.registry.lookup(&task_id).await.unwrap().state == TaskState::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let body = json!({ "handle": "cb-1", "result": { "url": "https://cdn/song.mp3" } });
        assert_eq!(
            h.orchestrator.handle_callback(Provider::Suno, &body).await.unwrap(),
            Some(TerminalWrite::Applied)
        );
        assert_eq!(
            h.orchestrator.handle_callback(Provider::Suno, &body).await.unwrap(),
            Some(TerminalWrite::AlreadyTerminal(TaskState::Completed))
        );

        h.orchestrator.drain().await;
        assert_eq!(
            h.orchestrator.resolve_short_link(&task_id).await.unwrap(),
            "https://cdn/song.mp3"
        );
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 0);

        let unknown = json!({ "handle": "nope", "result": {} });
        assert_matches!(
            h.orchestrator.handle_callback(Provider::Suno, &unknown).await,
            Err(OrchestratorError::Core(CoreError::NotFound { .. }))
        );
    }

    #[tokio::test]
    async fn resume_polls_pending_and_fails_interrupted_submissions() {
        let adapter = ScriptedAdapter::new(Provider::Kling)
            .on_poll(Ok(PollStatus::Completed { raw: json!({ "url": "https://cdn/r.mp4" }) }));
        let h = harness(adapter, 0, BUDGET).await;

        // Simulate state left behind by a previous process.
        h.ledger.grant(ACCOUNT, 40).await.unwrap();
        let pending_receipt = h.ledger.debit(ACCOUNT, OperationKind::VideoFast720).await.unwrap();
        let stuck_receipt = h.ledger.debit(ACCOUNT, OperationKind::VideoStd720).await.unwrap();
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 5);

        for (task_id, receipt) in [("pending1", &pending_receipt), ("stuck1", &stuck_receipt)] {
            h.registry
                .create(NewTask {
                    task_id: task_id.into(),
                    account_id: ACCOUNT,
                    provider: Provider::Kling,
                    operation_kind: receipt.operation,
                    receipt_id: receipt.receipt_id,
                })
                .await
                .unwrap();
        }
        h.registry.record_submitted("pending1", "h-old").await.unwrap();

        let summary = h.orchestrator.resume_unresolved().await.unwrap();
        assert_eq!(
            summary,
            ResumeSummary { resumed: 1, interrupted: 1, failed: 0 }
        );
        h.orchestrator.drain().await;

        assert_eq!(
            h.registry.lookup("pending1").await.unwrap().state,
            TaskState::Completed
        );
        let stuck = h.registry.lookup("stuck1").await.unwrap();
        assert_eq!(stuck.failure_code.as_deref(), Some("interrupted"));
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn shutdown_leaves_pending_tasks_resumable() {
        let h = harness(ScriptedAdapter::new(Provider::Kling), 20, BUDGET).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.orchestrator.shutdown().await;
        assert_eq!(h.orchestrator.active_workers(), 0);

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert!(!task.state.is_terminal());
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn lookup_normalizes_and_validates_ids() {
        let h = harness(ScriptedAdapter::new(Provider::Comet), 0, BUDGET).await;
        assert_matches!(
            h.orchestrator.lookup("  ").await,
            Err(OrchestratorError::Core(CoreError::Validation(_)))
        );
        assert_matches!(
            h.orchestrator.lookup(" unknown1 ").await,
            Err(OrchestratorError::Core(CoreError::NotFound { ref id, .. })) if id == "unknown1"
        );
    }

    /// Register a task against a real debit, bypassing the worker.
    async fn open_task(h: &Harness, task_id: &str, provider: Provider) {
        let receipt = h.ledger.debit(ACCOUNT, OperationKind::VideoFast720).await.unwrap();
        h.registry
            .create(NewTask {
                task_id: task_id.into(),
                account_id: ACCOUNT,
                provider,
                operation_kind: OperationKind::VideoFast720,
                receipt_id: receipt.receipt_id,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_write_keeps_debit_and_task_open() {
        let h = harness(ScriptedAdapter::new(Provider::Kling), 20, BUDGET).await;
        open_task(&h, "t1", Provider::Kling).await;
        h.registry.record_submitted("t1", "h1").await.unwrap();
        h.faults.failed_faults.store(1, Ordering::SeqCst);

        let lc = &h.orchestrator.lifecycle;
        assert_matches!(
            lc.settle_failed("t1", FailureReason::ProviderFailed("boom".into())).await,
            Err(OrchestratorError::Database(_))
        );
        // Neither half of the failure landed.
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 5);
        let task = h.registry.lookup("t1").await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.failure_code.is_none());

        // A completion arriving afterwards wins and stays paid for.
        assert_eq!(
            lc.settle_completed("t1", &json!({ "url": "https://cdn/late.mp4" }))
                .await
                .unwrap(),
            TerminalWrite::Applied
        );
        assert_eq!(
            lc.settle_failed("t1", FailureReason::Timeout).await.unwrap(),
            TerminalWrite::AlreadyTerminal(TaskState::Completed)
        );
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn failed_write_is_retried_by_the_worker() {
        let failed = || Ok(PollStatus::Failed { reason: "content policy".into() });
        let adapter = ScriptedAdapter::new(Provider::Kling)
            .on_poll(failed())
            .on_poll(failed())
            .on_poll(failed());
        let h = harness(adapter, 20, BUDGET).await;
        h.faults.failed_faults.store(2, Ordering::SeqCst);

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn submission_record_is_retried_until_it_lands() {
        let adapter = ScriptedAdapter::new(Provider::Kling)
            .on_poll(Ok(PollStatus::Completed { raw: json!({ "url": "https://cdn/v.mp4" }) }));
        let h = harness(adapter, 20, BUDGET).await;
        h.faults.submitted_faults.store(1, Ordering::SeqCst);

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.provider_job_handle.as_deref(), Some("h1"));
        assert_eq!(h.adapter.submit_calls(), 1);
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unrecordable_submission_fails_with_refund_at_deadline() {
        let h = harness(ScriptedAdapter::new(Provider::Kling), 20, Duration::from_millis(40)).await;
        h.faults.submitted_faults.store(usize::MAX, Ordering::SeqCst);

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.failure_code.as_deref(), Some("timeout"));
        assert_eq!(h.adapter.poll_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn synchronous_result_record_is_retried() {
        let adapter = ScriptedAdapter::new(Provider::Comet).on_submit(Ok(SubmitOutcome::Completed {
            raw: json!({ "url": "https://cdn/s.png" }),
        }));
        let h = harness(adapter, 5, BUDGET).await;
        h.faults.completed_faults.store(2, Ordering::SeqCst);

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "sticker", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        assert_eq!(
            h.orchestrator.resolve_short_link(&task_id).await.unwrap(),
            "https://cdn/s.png"
        );
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_primary_falls_back_under_same_receipt() {
        let kling = ScriptedAdapter::new(Provider::Kling).on_submit(Err(ProviderError::Rejected {
            status: 400,
            message: "region blocked".into(),
        }));
        let fal = ScriptedAdapter::new(Provider::Fal)
            .on_submit(Ok(SubmitOutcome::Accepted { handle: "fal-1".into() }))
            .on_poll(Ok(PollStatus::Completed { raw: json!({ "url": "https://cdn/fb.mp4" }) }));
        let routes = RoutingTable::empty()
            .with_route(OperationKind::VideoFast720, Provider::Kling)
            .with_fallback(OperationKind::VideoFast720, Provider::Fal);
        let h = build(vec![kling, fal], routes, providers(BUDGET, Some("f")), 20).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.provider, Provider::Fal);
        assert_eq!(task.provider_job_handle.as_deref(), Some("fal-1"));
        assert_eq!(h.adapter.submit_calls(), 1);
        // One debit for the whole chain.
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn exhausted_chain_fails_once_with_refund() {
        let kling = ScriptedAdapter::new(Provider::Kling).on_submit(Err(ProviderError::Rejected {
            status: 400,
            message: "region blocked".into(),
        }));
        let fal = ScriptedAdapter::new(Provider::Fal)
            .on_submit(Err(ProviderError::Unavailable("503".into())))
            .on_submit(Err(ProviderError::Unavailable("503".into())))
            .on_submit(Err(ProviderError::Unavailable("503".into())));
        let routes = RoutingTable::empty()
            .with_route(OperationKind::VideoFast720, Provider::Kling)
            .with_fallback(OperationKind::VideoFast720, Provider::Fal);
        let h = build(vec![kling, fal], routes, providers(BUDGET, Some("f")), 20).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.provider, Provider::Fal);
        assert_eq!(task.failure_code.as_deref(), Some("provider_unavailable"));
        assert_eq!(h.ledger.balance(ACCOUNT).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn unconfigured_fallback_is_skipped() {
        let routes = RoutingTable::empty()
            .with_route(OperationKind::VideoFast720, Provider::Fal)
            .with_fallback(OperationKind::VideoFast720, Provider::Kling);
        let adapters = vec![
            ScriptedAdapter::new(Provider::Fal),
            ScriptedAdapter::new(Provider::Kling)
                .on_poll(Ok(PollStatus::Completed { raw: json!({ "url": "https://cdn/k.mp4" }) })),
        ];
        // fal has no key, so kling becomes the primary.
        let h = build(adapters, routes, providers(BUDGET, None), 20).await;

        let task_id = h
            .orchestrator
            .request_generation(ACCOUNT, "video-fast-720", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let task = h.registry.lookup(&task_id).await.unwrap();
        assert_eq!(task.provider, Provider::Kling);
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(h.adapter.submit_calls(), 0);
    }

    #[tokio::test]
    async fn resume_counts_failures_and_keeps_going() {
        let adapter = ScriptedAdapter::new(Provider::Kling)
            .on_poll(Ok(PollStatus::Completed { raw: json!({ "url": "https://cdn/r.mp4" }) }));
        let h = harness(adapter, 15, BUDGET).await;

        // A submitting task whose receipt the ledger has never seen.
        h.registry
            .create(NewTask {
                task_id: "orphan1".into(),
                account_id: ACCOUNT,
                provider: Provider::Kling,
                operation_kind: OperationKind::VideoFast720,
                receipt_id: uuid::Uuid::now_v7(),
            })
            .await
            .unwrap();
        open_task(&h, "pending1", Provider::Kling).await;
        h.registry.record_submitted("pending1", "h-old").await.unwrap();

        let summary = h.orchestrator.resume_unresolved().await.unwrap();
        assert_eq!(
            summary,
            ResumeSummary { resumed: 1, interrupted: 0, failed: 1 }
        );
        h.orchestrator.drain().await;

        assert_eq!(
            h.registry.lookup("pending1").await.unwrap().state,
            TaskState::Completed
        );
        assert_eq!(
            h.registry.lookup("orphan1").await.unwrap().state,
            TaskState::Submitting
        );
    }

    #[tokio::test]
    async fn transactions_follow_the_task_lifecycle() {
        let adapter = ScriptedAdapter::new(Provider::Comet).on_submit(Err(ProviderError::Rejected {
            status: 400,
            message: "bad prompt".into(),
        }));
        let h = harness(adapter, 10, BUDGET).await;

        h.orchestrator
            .request_generation(ACCOUNT, "image-generation", json!({}))
            .await
            .unwrap();
        h.orchestrator.drain().await;

        let kinds: Vec<_> = h
            .orchestrator
            .transactions(ACCOUNT, 10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.kind.as_str(), t.amount, t.balance_after))
            .collect();
        assert_eq!(kinds, vec![("refund", 8, 10), ("debit", -8, 2), ("grant", 10, 10)]);
    }
}
