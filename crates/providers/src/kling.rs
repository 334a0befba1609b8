//! Kling video adapter.
//!
//! Authenticates with a per-request HS256 token. Every response is wrapped
//! in an envelope `{code, message, request_id, data}` where `code == 0`
//! means success; job status lives in `data.task_status`.

use async_trait::async_trait;
use mvstudio_core::credits::OperationKind;
use mvstudio_core::task::{AuthStyle, Provider};
use serde::Deserialize;
use serde_json::Value;

use crate::adapter::{first_url, payload_object, PollStatus, ProviderAdapter, SubmitOutcome};
use crate::config::ProviderSettings;
use crate::credential::ProviderCredential;
use crate::error::ProviderError;
use crate::http::ProviderHttp;

const OMNI_VIDEO_PATH: &str = "/v1/videos/omni-video";
const DEFAULT_MODEL: &str = "kling-v3-omni";

/// Envelope codes Kling uses for throttling.
const RATE_LIMIT_CODES: [i64; 2] = [1302, 1303];

/// Envelope codes at or above this are Kling-side faults.
const SERVER_ERROR_CODE_MIN: i64 = 5000;

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<TaskData>,
}

#[derive(Debug, Deserialize)]
struct TaskData {
    task_id: String,
    #[serde(default)]
    task_status: Option<TaskStatus>,
    #[serde(default)]
    task_status_msg: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskStatus {
    Submitted,
    Processing,
    Succeed,
    Failed,
}

pub struct KlingAdapter {
    http: ProviderHttp,
}

impl KlingAdapter {
    pub fn new(settings: &ProviderSettings) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: ProviderHttp::new(settings)?,
        })
    }

    /// Decode the envelope and turn a non-zero `code` into an error.
    fn open_envelope(body: Value) -> Result<(Envelope, Value), ProviderError> {
        let envelope: Envelope = serde_json::from_value(body.clone())
            .map_err(|e| ProviderError::MalformedResult(format!("kling envelope: {e}")))?;

        match envelope.code {
            0 => {
                let data = body.get("data").cloned().unwrap_or(Value::Null);
                Ok((envelope, data))
            }
            code if RATE_LIMIT_CODES.contains(&code) || code >= SERVER_ERROR_CODE_MIN => Err(
                ProviderError::Unavailable(format!("kling code {code}: {}", envelope.message)),
            ),
            code => Err(ProviderError::Rejected {
                status: 400,
                message: format!("kling code {code}: {}", envelope.message),
            }),
        }
    }
}

#[async_trait]
impl ProviderAdapter for KlingAdapter {
    fn provider(&self) -> Provider {
        Provider::Kling
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::SignedToken
    }

    fn supports(&self, kind: OperationKind) -> bool {
        kind.is_video()
    }

    async fn submit(
        &self,
        kind: OperationKind,
        payload: &Value,
        credential: &ProviderCredential,
    ) -> Result<SubmitOutcome, ProviderError> {
        if !self.supports(kind) {
            return Err(ProviderError::UnsupportedOperation(kind, Provider::Kling));
        }

        let mut body = payload_object(payload)?;
        body.entry("model_name")
            .or_insert_with(|| Value::from(DEFAULT_MODEL));
        // Standard-quality tiers render in Kling's "pro" mode.
        let mode = match kind {
            OperationKind::VideoStd720 | OperationKind::VideoStd1080 => "pro",
            _ => "std",
        };
        body.entry("mode").or_insert_with(|| Value::from(mode));

        let response = self
            .http
            .post_json(OMNI_VIDEO_PATH, &Value::Object(body), credential)
            .await?;
        let (envelope, _) = Self::open_envelope(response)?;
        let data = envelope
            .data
            .ok_or_else(|| ProviderError::MalformedResult("kling submit without data".into()))?;

        tracing::debug!(operation = %kind, handle = %data.task_id, "Kling job accepted");
        Ok(SubmitOutcome::Accepted {
            handle: data.task_id,
        })
    }

    async fn poll(
        &self,
        handle: &str,
        credential: &ProviderCredential,
    ) -> Result<PollStatus, ProviderError> {
        let Some(response) = self
            .http
            .get_json(&format!("{OMNI_VIDEO_PATH}/{handle}"), credential)
            .await?
        else {
            return Ok(PollStatus::Pending);
        };

        let (envelope, raw) = Self::open_envelope(response)?;
        let Some(data) = envelope.data else {
            return Ok(PollStatus::Pending);
        };

        Ok(match data.task_status {
            None | Some(TaskStatus::Submitted) | Some(TaskStatus::Processing) => {
                PollStatus::Pending
            }
            Some(TaskStatus::Succeed) => PollStatus::Completed { raw },
            Some(TaskStatus::Failed) => PollStatus::Failed {
                reason: data
                    .task_status_msg
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "kling reported failure".into()),
            },
        })
    }

    fn parse_result(&self, raw: &Value) -> Result<String, ProviderError> {
        first_url(raw, &["/task_result/videos/0/url", "/task_result/images/0/url"])
    }
}
