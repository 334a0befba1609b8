#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use mvstudio_api::auth::jwt::{generate_access_token, JwtConfig};
use mvstudio_api::config::ServerConfig;
use mvstudio_api::router::build_app_router;
use mvstudio_api::state::AppState;
use mvstudio_core::credits::OperationKind;
use mvstudio_core::task::{AuthStyle, Provider};
use mvstudio_core::types::AccountId;
use mvstudio_orchestrator::config::OrchestratorConfig;
use mvstudio_orchestrator::ledger::{CreditLedger, MemoryCreditLedger};
use mvstudio_orchestrator::registry::MemoryTaskRegistry;
use mvstudio_orchestrator::routing::RoutingTable;
use mvstudio_orchestrator::Orchestrator;
use mvstudio_providers::adapter::{
    first_url, AdapterSet, CallbackNotice, PollStatus, ProviderAdapter, SubmitOutcome,
};
use mvstudio_providers::config::{CredentialSource, ProviderSettings, ProvidersConfig};
use mvstudio_providers::credential::ProviderCredential;
use mvstudio_providers::error::ProviderError;
use serde_json::{json, Value};
use tower::ServiceExt;

pub const CALLBACK_TOKEN: &str = "callback-secret";
pub const ADMIN_TOKEN: &str = "admin-secret";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        jwt: JwtConfig {
            secret: "test-secret-that-is-long-enough-for-hmac".to_string(),
            access_token_expiry_mins: 15,
            leeway_secs: 60,
        },
        callback_token: Some(CALLBACK_TOKEN.to_string()),
        admin_token: Some(ADMIN_TOKEN.to_string()),
    }
}

pub fn token_for(account_id: AccountId) -> String {
    generate_access_token(account_id, &test_config().jwt).expect("token generation should succeed")
}

/// Synchronous image provider: every submit completes with a fixed URL.
struct InstantImages;

#[async_trait]
impl ProviderAdapter for InstantImages {
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
        _kind: OperationKind,
        payload: &Value,
        _credential: &ProviderCredential,
    ) -> Result<SubmitOutcome, ProviderError> {
        if payload["prompt"] == "reject me" {
            return Err(ProviderError::Rejected {
                status: 400,
                message: "prompt rejected".into(),
            });
        }
        Ok(SubmitOutcome::Completed {
            raw: json!({ "url": "https://cdn/x.png" }),
        })
    }

    async fn poll(
        &self,
        _handle: &str,
        _credential: &ProviderCredential,
    ) -> Result<PollStatus, ProviderError> {
        Ok(PollStatus::Failed {
            reason: "nothing to poll".into(),
        })
    }

    fn parse_result(&self, raw: &Value) -> Result<String, ProviderError> {
        first_url(raw, &["/url"])
    }
}

/// Callback-driven music provider: submit accepts with handle `song-1`,
/// polls stay pending, callbacks carry the result.
struct CallbackMusic;

#[async_trait]
impl ProviderAdapter for CallbackMusic {
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
        _kind: OperationKind,
        _payload: &Value,
        _credential: &ProviderCredential,
    ) -> Result<SubmitOutcome, ProviderError> {
        Ok(SubmitOutcome::Accepted {
            handle: "song-1".into(),
        })
    }

    async fn poll(
        &self,
        _handle: &str,
        _credential: &ProviderCredential,
    ) -> Result<PollStatus, ProviderError> {
        Ok(PollStatus::Pending)
    }

    fn parse_result(&self, raw: &Value) -> Result<String, ProviderError> {
        first_url(raw, &["/audio_url"])
    }

    fn parse_callback(&self, body: &Value) -> Result<Option<CallbackNotice>, ProviderError> {
        let handle = body["task_id"]
            .as_str()
            .ok_or_else(|| ProviderError::InvalidPayload("missing task_id".into()))?;
        Ok(Some(CallbackNotice {
            handle: handle.to_string(),
            status: PollStatus::Completed {
                raw: body["result"].clone(),
            },
        }))
    }
}

fn settings(key: Option<&str>) -> ProviderSettings {
    let mut settings = ProviderSettings::new(
        "http://unused.invalid",
        CredentialSource::Static {
            key: key.map(String::from),
        },
    );
    settings.poll_interval = Duration::from_millis(5);
    settings.max_wait = Duration::from_secs(5);
    settings
}

pub struct TestApp {
    pub router: Router,
    pub orchestrator: Arc<Orchestrator>,
    pub ledger: Arc<MemoryCreditLedger>,
}

/// Build the full application on in-memory stores and scripted providers.
///
/// Kling and fal use their real adapters without keys, so video and 3D
/// operations fail with a missing credential on every provider of their
/// route.
pub async fn build_test_app() -> TestApp {
    let ledger = Arc::new(MemoryCreditLedger::default());
    let registry = Arc::new(MemoryTaskRegistry::new(ledger.clone()));

    let providers = Arc::new(ProvidersConfig {
        kling: settings(None),
        suno: settings(Some("suno-key")),
        fal: settings(None),
        comet: settings(Some("comet-key")),
        suno_callback_url: None,
        fal_3d_model: "fal-ai/test".into(),
    });

    let mut adapters = AdapterSet::from_config(&providers).expect("provider clients should build");
    adapters.register(Arc::new(InstantImages));
    adapters.register(Arc::new(CallbackMusic));

    let orchestrator = Arc::new(Orchestrator::new(
        ledger.clone(),
        registry,
        adapters,
        providers,
        RoutingTable::default(),
        OrchestratorConfig::default(),
    ));

    let config = test_config();
    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        config: Arc::new(config.clone()),
        pool: None,
    };

    TestApp {
        router: build_app_router(state, &config),
        orchestrator,
        ledger,
    }
}

impl TestApp {
    pub async fn grant(&self, account_id: AccountId, amount: i64) {
        self.ledger
            .grant(account_id, amount)
            .await
            .expect("grant should succeed");
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

async fn send(app: Router, request: Request<Body>) -> Response {
    app.oneshot(request).await.expect("request should be served")
}

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    send(app, request).await
}

pub async fn get_auth(app: Router, uri: &str, token: &str) -> Response {
    let request = Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request should build");
    send(app, request).await
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build");
    send(app, request).await
}

pub async fn post_json_with(
    app: Router,
    uri: &str,
    header: (&str, &str),
    body: Value,
) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .header(header.0, header.1)
        .body(Body::from(body.to_string()))
        .expect("request should build");
    send(app, request).await
}

pub async fn post_json_auth(app: Router, uri: &str, token: &str, body: Value) -> Response {
    post_json_with(app, uri, ("authorization", &format!("Bearer {token}")), body).await
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should be readable")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body should be JSON")
}
