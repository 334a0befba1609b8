//! Suno music adapter.
//!
//! Static bearer key. Responses use `{code, msg, data}` with `code == 200`
//! on success. Suno can also push completion to a configured callback URL;
//! callback bodies decode into the same [`PollStatus`] as a poll.

use async_trait::async_trait;
use mvstudio_core::credits::OperationKind;
use mvstudio_core::task::{AuthStyle, Provider};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::adapter::{
    first_url, payload_object, CallbackNotice, PollStatus, ProviderAdapter, SubmitOutcome,
};
use crate::config::ProviderSettings;
use crate::credential::ProviderCredential;
use crate::error::ProviderError;
use crate::http::ProviderHttp;

const GENERATE_PATH: &str = "/api/v1/generate";
const RECORD_INFO_PATH: &str = "/api/v1/generate/record-info";

const CODE_OK: i64 = 200;

/// Suno codes for throttling and maintenance.
const TRANSIENT_CODES: [i64; 2] = [430, 455];

/// Where the first track's audio may live, across API revisions.
const AUDIO_POINTERS: [&str; 4] = [
    "/response/data/0/audio_url",
    "/response/sunoData/0/audioUrl",
    "/response/data/0/stream_audio_url",
    "/response/sunoData/0/streamAudioUrl",
];

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitData {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackData {
    #[serde(default)]
    callback_type: String,
    #[serde(alias = "task_id")]
    task_id: String,
    #[serde(default)]
    data: Value,
}

pub struct SunoAdapter {
    http: ProviderHttp,
    callback_url: Option<String>,
}

impl SunoAdapter {
    pub fn new(
        settings: &ProviderSettings,
        callback_url: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: ProviderHttp::new(settings)?,
            callback_url,
        })
    }

    fn open_envelope(body: Value) -> Result<Value, ProviderError> {
        let envelope: Envelope = serde_json::from_value(body)
            .map_err(|e| ProviderError::MalformedResult(format!("suno envelope: {e}")))?;
        match envelope.code {
            CODE_OK => Ok(envelope.data),
            code if TRANSIENT_CODES.contains(&code) || code >= 500 => Err(
                ProviderError::Unavailable(format!("suno code {code}: {}", envelope.msg)),
            ),
            code => Err(ProviderError::Rejected {
                status: u16::try_from(code).unwrap_or(400),
                message: envelope.msg,
            }),
        }
    }
}

/// Map a Suno record status onto a normalized poll status.
fn status_from(status: &str, error_message: Option<String>, raw: Value) -> PollStatus {
    match status {
        "SUCCESS" | "FIRST_SUCCESS" => PollStatus::Completed { raw },
        s if s.ends_with("FAILED") || s.ends_with("ERROR") || s == "CALLBACK_EXCEPTION" => {
            PollStatus::Failed {
                reason: error_message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("suno status {s}")),
            }
        }
        _ => PollStatus::Pending,
    }
}

#[async_trait]
impl ProviderAdapter for SunoAdapter {
    fn provider(&self) -> Provider {
        Provider::Suno
    }

    fn auth_style(&self) -> AuthStyle {
        AuthStyle::StaticBearer
    }

    fn supports(&self, kind: OperationKind) -> bool {
        kind == OperationKind::Music
    }

    async fn submit(
        &self,
        kind: OperationKind,
        payload: &Value,
        credential: &ProviderCredential,
    ) -> Result<SubmitOutcome, ProviderError> {
        if !self.supports(kind) {
            return Err(ProviderError::UnsupportedOperation(kind, Provider::Suno));
        }

        let mut body = payload_object(payload)?;
        // Suno requires the field; an empty value disables callbacks.
        body.insert(
            "callBackUrl".into(),
            Value::from(self.callback_url.clone().unwrap_or_default()),
        );

        let response = self
            .http
            .post_json(GENERATE_PATH, &Value::Object(body), credential)
            .await?;
        let data: SubmitData = serde_json::from_value(Self::open_envelope(response)?)
            .map_err(|e| ProviderError::MalformedResult(format!("suno submit: {e}")))?;
        if data.task_id.is_empty() {
            return Err(ProviderError::MalformedResult("suno returned empty taskId".into()));
        }

        tracing::debug!(handle = %data.task_id, "Suno job accepted");
        Ok(SubmitOutcome::Accepted {
            handle: data.task_id,
        })
    }

    async fn poll(
        &self,
        handle: &str,
        credential: &ProviderCredential,
    ) -> Result<PollStatus, ProviderError> {
        let path = format!("{RECORD_INFO_PATH}?taskId={handle}");
        let Some(response) = self.http.get_json(&path, credential).await? else {
            return Ok(PollStatus::Pending);
        };

        let raw = Self::open_envelope(response)?;
        if raw.is_null() {
            return Ok(PollStatus::Pending);
        }
        let info: RecordInfo = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::MalformedResult(format!("suno record: {e}")))?;

        Ok(status_from(&info.status, info.error_message, raw))
    }

    fn parse_result(&self, raw: &Value) -> Result<String, ProviderError> {
        first_url(raw, &AUDIO_POINTERS)
    }

    fn parse_callback(&self, body: &Value) -> Result<Option<CallbackNotice>, ProviderError> {
        let envelope: Envelope = serde_json::from_value(body.clone())
            .map_err(|e| ProviderError::MalformedResult(format!("suno callback: {e}")))?;
        let data: CallbackData = serde_json::from_value(envelope.data)
            .map_err(|e| ProviderError::MalformedResult(format!("suno callback data: {e}")))?;

        let status = if envelope.code != CODE_OK || data.callback_type == "error" {
            PollStatus::Failed {
                reason: if envelope.msg.is_empty() {
                    "suno reported failure".into()
                } else {
                    envelope.msg
                },
            }
        } else if data.callback_type == "complete" {
            PollStatus::Completed {
                raw: json!({ "response": { "data": data.data } }),
            }
        } else {
            // "text" and "first" are progress notifications.
            return Ok(None);
        };

        Ok(Some(CallbackNotice {
            handle: data.task_id,
            status,
        }))
    }
}
