//! fal.ai queue adapter, used for 3D conversion and as the fallback route
//! for Kling video.
//!
//! Jobs are queued with `POST /{model}`; status and result live under
//! `/{app}/requests/{request_id}`, where `app` is the first two segments of
//! the model path (`fal-ai/hunyuan3d/v2` queues under `fal-ai/hunyuan3d`).
//! That request path is the job handle, so polling never needs to know which
//! model the job was queued on.

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

/// Kling models served by fal's "o3" endpoints.
const OMNI_MODELS: [&str; 2] = ["kling-v3-omni", "kling-video-o1"];
const DEFAULT_VIDEO_MODEL: &str = "kling-v3-omni";

const RESULT_POINTERS: [&str; 4] = [
    "/model_mesh/url",
    "/model_glb/url",
    "/model_urls/glb/url",
    "/video/url",
];

#[derive(Debug, Deserialize)]
struct QueueReceipt {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct QueueStatus {
    status: QueueState,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum QueueState {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Error,
    #[serde(other)]
    Unknown,
}

pub struct FalAdapter {
    http: ProviderHttp,
    model_3d: String,
}

impl FalAdapter {
    pub fn new(settings: &ProviderSettings, model_3d: String) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: ProviderHttp::new(settings)?,
            model_3d: model_3d.trim_matches('/').to_string(),
        })
    }
}

fn is_video(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::VideoFast720
            | OperationKind::VideoFast1080
            | OperationKind::VideoStd720
            | OperationKind::VideoStd1080
    )
}

/// Queue app id: the owner and app segments of a model path.
fn app_id(model: &str) -> String {
    model.split('/').take(2).collect::<Vec<_>>().join("/")
}

/// fal-hosted Kling endpoint for a video request.
fn kling_video_model(kind: OperationKind, body: &serde_json::Map<String, Value>) -> String {
    let model_name = body
        .get("model_name")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_VIDEO_MODEL);
    let mode = body.get("mode").and_then(Value::as_str).unwrap_or(match kind {
        OperationKind::VideoStd720 | OperationKind::VideoStd1080 => "pro",
        _ => "std",
    });
    let tier = if OMNI_MODELS.contains(&model_name) {
        "o3"
    } else if mode == "pro" {
        "v3/pro"
    } else {
        "v3/standard"
    };
    let flavor = if first_image_url(body).is_some() {
        "image-to-video"
    } else {
        "text-to-video"
    };
    format!("fal-ai/kling-video/{tier}/{flavor}")
}

fn first_image_url(body: &serde_json::Map<String, Value>) -> Option<&str> {
    body.get("image_list")
        .and_then(|list| list.pointer("/0/image_url"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
}

/// Translate a Kling omni-video payload into fal's input shape.
fn kling_video_input(body: &serde_json::Map<String, Value>) -> Result<Value, ProviderError> {
    let prompt = body
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::InvalidPayload("video payload needs a prompt".into()))?;

    let mut input = serde_json::Map::new();
    input.insert("prompt".into(), Value::from(prompt));
    for key in ["negative_prompt", "aspect_ratio"] {
        if let Some(value) = body.get(key).and_then(Value::as_str).filter(|v| !v.is_empty()) {
            input.insert(key.into(), Value::from(value));
        }
    }
    if let Some(duration) = body.get("duration") {
        let secs = match duration {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        input.insert("duration".into(), Value::from(secs.unwrap_or(5)));
    }
    if let Some(cfg_scale) = body.get("cfg_scale").filter(|v| v.is_number()) {
        input.insert("cfg_scale".into(), cfg_scale.clone());
    }
    if let Some(url) = first_image_url(body) {
        input.insert("image_url".into(), Value::from(url));
    }
    Ok(Value::Object(input))
}

#[async_trait]
impl ProviderAdapter for FalAdapter {
    fn provider(&self) -> Provider {
        Provider::Fal
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::StaticBearer
    }

    fn supports(&self, kind: OperationKind) -> bool {
        kind == OperationKind::ThreeDConversion || is_video(kind)
    }

    async fn submit(
        &self,
        kind: OperationKind,
        payload: &Value,
        credential: &ProviderCredential,
    ) -> Result<SubmitOutcome, ProviderError> {
        if !self.supports(kind) {
            return Err(ProviderError::UnsupportedOperation(kind, Provider::Fal));
        }
        let body = payload_object(payload)?;
        let (model, input) = if is_video(kind) {
            (kling_video_model(kind, &body), kling_video_input(&body)?)
        } else {
            (self.model_3d.clone(), Value::Object(body))
        };

        let response = self
            .http
            .post_json(&format!("/{model}"), &input, credential)
            .await?;
        let receipt: QueueReceipt = serde_json::from_value(response)
            .map_err(|e| ProviderError::MalformedResult(format!("fal queue receipt: {e}")))?;

        let handle = format!("{}/requests/{}", app_id(&model), receipt.request_id);
        tracing::debug!(%model, %handle, "fal job queued");
        Ok(SubmitOutcome::Accepted { handle })
    }

    async fn poll(
        &self,
        handle: &str,
        credential: &ProviderCredential,
    ) -> Result<PollStatus, ProviderError> {
        let request_path = format!("/{}", handle.trim_start_matches('/'));
        let status_path = format!("{request_path}/status");
        let Some(response) = self.http.get_json(&status_path, credential).await? else {
            return Ok(PollStatus::Pending);
        };
        let status: QueueStatus = serde_json::from_value(response)
            .map_err(|e| ProviderError::MalformedResult(format!("fal status: {e}")))?;

        match status.status {
            QueueState::InQueue | QueueState::InProgress | QueueState::Unknown => {
                Ok(PollStatus::Pending)
            }
            QueueState::Failed | QueueState::Error => Ok(PollStatus::Failed {
                reason: status.error.unwrap_or_else(|| "fal reported failure".into()),
            }),
            QueueState::Completed => {
                // A completed request whose result fetch is refused failed
                // inside the model.
                match self.http.get_json(&request_path, credential).await {
                    Ok(Some(raw)) => Ok(PollStatus::Completed { raw }),
                    Ok(None) => Ok(PollStatus::Pending),
                    Err(ProviderError::Rejected { message, .. }) => {
                        Ok(PollStatus::Failed { reason: message })
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn parse_result(&self, raw: &Value) -> Result<String, ProviderError> {
        first_url(raw, &RESULT_POINTERS)
    }
}
