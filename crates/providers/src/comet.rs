//! Comet image adapter (OpenAI-compatible `images/generations`).
//!
//! Synchronous: the submit response already carries the image, so tasks
//! routed here go straight from `submitting` to `completed`.

use async_trait::async_trait;
use mvstudio_core::credits::OperationKind;
use mvstudio_core::task::{AuthStyle, Provider};
use serde_json::Value;

use crate::adapter::{first_url, payload_object, PollStatus, ProviderAdapter, SubmitOutcome};
use crate::config::ProviderSettings;
use crate::credential::ProviderCredential;
use crate::error::ProviderError;
use crate::http::ProviderHttp;

const IMAGES_PATH: &str = "/v1/images/generations";

pub struct CometAdapter {
    http: ProviderHttp,
}

impl CometAdapter {
    pub fn new(settings: &ProviderSettings) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: ProviderHttp::new(settings)?,
        })
    }
}

#[async_trait]
impl ProviderAdapter for CometAdapter {
    fn provider(&self) -> Provider {
        Provider::Comet
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::StaticBearer
    }

    fn supports(&self, kind: OperationKind) -> bool {
        matches!(
            kind,
            OperationKind::ImageGeneration | OperationKind::Avatar | OperationKind::Sticker
        )
    }

    async fn submit(
        &self,
        kind: OperationKind,
        payload: &Value,
        credential: &ProviderCredential,
    ) -> Result<SubmitOutcome, ProviderError> {
        if !self.supports(kind) {
            return Err(ProviderError::UnsupportedOperation(kind, Provider::Comet));
        }
        let body = payload_object(payload)?;

        let raw = self
            .http
            .post_json(IMAGES_PATH, &Value::Object(body), credential)
            .await?;
        Ok(SubmitOutcome::Completed { raw })
    }

    async fn poll(
        &self,
        _handle: &str,
        _credential: &ProviderCredential,
    ) -> Result<PollStatus, ProviderError> {
        // Nothing is ever queued here, so a task that reaches the poll
        // path lost its submit response.
        Ok(PollStatus::Failed {
            reason: "synchronous provider has no job to poll".into(),
        })
    }

    fn parse_result(&self, raw: &Value) -> Result<String, ProviderError> {
        first_url(raw, &["/data/0/url"])
    }
}
