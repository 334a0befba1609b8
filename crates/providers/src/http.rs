//! Shared JSON-over-HTTP client for provider adapters.
//!
//! Maps transport outcomes onto [`ProviderError`]: network failures,
//! request timeouts, 408, 429 and 5xx are transient; every other non-2xx
//! status is a permanent rejection; an undecodable 2xx body is malformed.

use reqwest::StatusCode;
use serde_json::Value;

use crate::config::ProviderSettings;
use crate::credential::ProviderCredential;
use crate::error::ProviderError;

/// Longest slice of an error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client bound to one provider's base URL.
#[derive(Clone)]
pub struct ProviderHttp {
    client: reqwest::Client,
    base_url: String,
}

impl ProviderHttp {
    pub fn new(settings: &ProviderSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `POST` a JSON body and decode the JSON response.
    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        credential: &ProviderCredential,
    ) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(self.url(path))
            .header(reqwest::header::AUTHORIZATION, credential.authorization_header())
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        Self::parse_response(response).await
    }

    /// `GET` a JSON resource. A 404 yields `Ok(None)` so callers can treat
    /// a job the provider has not indexed yet as still pending.
    pub async fn get_json(
        &self,
        path: &str,
        credential: &ProviderCredential,
    ) -> Result<Option<Value>, ProviderError> {
        let response = self
            .client
            .get(self.url(path))
            .header(reqwest::header::AUTHORIZATION, credential.authorization_header())
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse_response(response).await.map(Some)
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        let message = truncate(&body);

        if is_transient(status) {
            Err(ProviderError::Unavailable(format!(
                "HTTP {}: {message}",
                status.as_u16()
            )))
        } else {
            Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn parse_response(response: reqwest::Response) -> Result<Value, ProviderError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await.map_err(transport_error)?;
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::MalformedResult(format!("response is not JSON: {e}")))
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Unavailable("request timed out".into())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
