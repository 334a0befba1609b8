//! The provider adapter contract.
//!
//! The orchestrator only ever talks to providers through
//! [`ProviderAdapter`]: submit a payload, poll a job handle, and turn a raw
//! completed result into an asset URL. Each adapter owns its wire format.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mvstudio_core::credits::OperationKind;
use mvstudio_core::task::{AuthStyle, Provider};
use serde_json::Value;

use crate::comet::CometAdapter;
use crate::config::ProvidersConfig;
use crate::credential::ProviderCredential;
use crate::error::ProviderError;
use crate::fal::FalAdapter;
use crate::kling::KlingAdapter;
use crate::suno::SunoAdapter;

/// What a successful submit produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The provider queued the job under `handle`.
    Accepted { handle: String },
    /// Synchronous provider: the raw result is already available.
    Completed { raw: Value },
}

/// Normalized status of a provider job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Completed { raw: Value },
    Failed { reason: String },
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollStatus::Pending)
    }
}

/// A provider-pushed status update, decoded by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackNotice {
    pub handle: String,
    pub status: PollStatus,
}

/// One external generation service.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Which credential style the adapter expects.
    fn auth_style(&self) -> AuthStyle;

    /// Whether this adapter can serve `kind`.
    fn supports(&self, kind: OperationKind) -> bool;

    /// Send an opaque generation payload.
    ///
    /// 4xx-class refusals are [`ProviderError::Rejected`]; transient
    /// failures are [`ProviderError::Unavailable`].
    async fn submit(
        &self,
        kind: OperationKind,
        payload: &Value,
        credential: &ProviderCredential,
    ) -> Result<SubmitOutcome, ProviderError>;

    /// Idempotent status check. A job the provider does not know yet is
    /// reported as [`PollStatus::Pending`].
    async fn poll(
        &self,
        handle: &str,
        credential: &ProviderCredential,
    ) -> Result<PollStatus, ProviderError>;

    /// Extract the durable asset URL from a completed raw result.
    fn parse_result(&self, raw: &Value) -> Result<String, ProviderError>;

    /// Decode a provider callback body. Adapters without callback support
    /// ignore every body.
    fn parse_callback(&self, _body: &Value) -> Result<Option<CallbackNotice>, ProviderError> {
        Ok(None)
    }
}

/// Registered adapters keyed by provider.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the production adapters for every provider.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, reqwest::Error> {
        let mut set = Self::new();
        set.register(Arc::new(KlingAdapter::new(&config.kling)?));
        set.register(Arc::new(SunoAdapter::new(
            &config.suno,
            config.suno_callback_url.clone(),
        )?));
        set.register(Arc::new(FalAdapter::new(
            &config.fal,
            config.fal_3d_model.clone(),
        )?));
        set.register(Arc::new(CometAdapter::new(&config.comet)?));
        Ok(set)
    }

    /// Add or replace the adapter for its provider.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// First non-empty absolute `http(s)` URL found at any of `pointers`.
///
/// Any other shape is [`ProviderError::MalformedResult`].
pub fn first_url(raw: &Value, pointers: &[&str]) -> Result<String, ProviderError> {
    for pointer in pointers {
        if let Some(url) = raw.pointer(pointer).and_then(Value::as_str) {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            if url.starts_with("https://") || url.starts_with("http://") {
                return Ok(url.to_string());
            }
            return Err(ProviderError::MalformedResult(format!(
                "asset reference at {pointer} is not an http(s) URL"
            )));
        }
    }
    Err(ProviderError::MalformedResult(format!(
        "no asset URL at any of {}",
        pointers.join(", ")
    )))
}

/// Reject anything but a JSON object as an outbound payload.
pub(crate) fn payload_object(
    payload: &Value,
) -> Result<serde_json::Map<String, Value>, ProviderError> {
    payload
        .as_object()
        .cloned()
        .ok_or_else(|| ProviderError::InvalidPayload("payload must be a JSON object".into()))
}
