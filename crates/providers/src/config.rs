//! Provider configuration, built once at startup.
//!
//! Missing keys are not an error here: a provider without credentials is
//! simply unusable, and the orchestrator refuses requests routed to it with
//! `MissingCredential` before any side effect.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use mvstudio_core::task::{AuthStyle, Provider};

/// Default lifetime of a signed provider token (30 minutes).
pub const DEFAULT_SIGNED_TTL_SECS: i64 = 1800;

/// Default `nbf` backdating that absorbs clock drift with the provider.
pub const DEFAULT_SKEW_SECS: i64 = 5;

/// Default per-request HTTP timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_KLING_BASE_URL: &str = "https://api-beijing.klingai.com";
pub const DEFAULT_SUNO_BASE_URL: &str = "https://api.sunoapi.org";
pub const DEFAULT_FAL_BASE_URL: &str = "https://queue.fal.run";
pub const DEFAULT_COMET_BASE_URL: &str = "https://api.cometapi.com";
pub const DEFAULT_FAL_3D_MODEL: &str = "fal-ai/hunyuan3d/v2";

/// Where an adapter's authentication material comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// A bearer key constant for the process lifetime.
    Static { key: Option<String> },
    /// An issuer id and shared secret used to mint short-lived HS256 tokens.
    Signed {
        access_key: Option<String>,
        secret_key: Option<String>,
        ttl_secs: i64,
        skew_secs: i64,
    },
}

impl CredentialSource {
    /// Whether every piece of key material is present.
    pub fn is_configured(&self) -> bool {
        match self {
            CredentialSource::Static { key } => key.is_some(),
            CredentialSource::Signed {
                access_key,
                secret_key,
                ..
            } => access_key.is_some() && secret_key.is_some(),
        }
    }

    /// The authentication style this source produces.
    pub fn auth_style(&self) -> AuthStyle {
        match self {
            CredentialSource::Static { .. } => AuthStyle::StaticBearer,
            CredentialSource::Signed { .. } => AuthStyle::SignedToken,
        }
    }
}

// Key material must never reach logs, including `{:?}` of the config.
impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Static { key } => f
                .debug_struct("Static")
                .field("key", &key.as_ref().map(|_| "<redacted>"))
                .finish(),
            CredentialSource::Signed {
                access_key,
                secret_key,
                ttl_secs,
                skew_secs,
            } => f
                .debug_struct("Signed")
                .field("access_key", access_key)
                .field("secret_key", &secret_key.as_ref().map(|_| "<redacted>"))
                .field("ttl_secs", ttl_secs)
                .field("skew_secs", skew_secs)
                .finish(),
        }
    }
}

/// Connection and lifecycle settings for one provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub credential: CredentialSource,
    /// Timeout applied to each outbound HTTP request.
    pub request_timeout: Duration,
    /// Delay between two status polls of the same job.
    pub poll_interval: Duration,
    /// Wall-clock budget from task creation to a terminal state.
    pub max_wait: Duration,
}

impl ProviderSettings {
    /// Settings with library defaults for everything but URL and credential.
    pub fn new(base_url: impl Into<String>, credential: CredentialSource) -> Self {
        Self {
            base_url: base_url.into(),
            credential,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(600),
        }
    }
}

/// Settings for every supported provider.
#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub kling: ProviderSettings,
    pub suno: ProviderSettings,
    pub fal: ProviderSettings,
    pub comet: ProviderSettings,
    /// Public URL Suno should POST completion callbacks to.
    pub suno_callback_url: Option<String>,
    /// fal.ai model path used for 3D conversion.
    pub fal_3d_model: String,
}

impl ProvidersConfig {
    /// Load provider configuration from environment variables.
    ///
    /// | Env Var                       | Default                            |
    /// |-------------------------------|------------------------------------|
    /// | `KLING_BASE_URL`              | `https://api-beijing.klingai.com`  |
    /// | `KLING_ACCESS_KEY`            | --                                 |
    /// | `KLING_SECRET_KEY`            | --                                 |
    /// | `KLING_TOKEN_TTL_SECS`        | `1800`                             |
    /// | `KLING_TOKEN_SKEW_SECS`       | `5`                                |
    /// | `KLING_POLL_INTERVAL_SECS`    | `5`                                |
    /// | `KLING_MAX_WAIT_SECS`         | `900`                              |
    /// | `SUNO_BASE_URL`               | `https://api.sunoapi.org`          |
    /// | `SUNO_API_KEY`                | --                                 |
    /// | `SUNO_CALLBACK_URL`           | --                                 |
    /// | `SUNO_POLL_INTERVAL_SECS`     | `5`                                |
    /// | `SUNO_MAX_WAIT_SECS`          | `600`                              |
    /// | `FAL_BASE_URL`                | `https://queue.fal.run`            |
    /// | `FAL_API_KEY`                 | --                                 |
    /// | `FAL_3D_MODEL`                | `fal-ai/hunyuan3d/v2`              |
    /// | `FAL_POLL_INTERVAL_SECS`      | `3`                                |
    /// | `FAL_MAX_WAIT_SECS`           | `600`                              |
    /// | `COMET_BASE_URL`              | `https://api.cometapi.com`         |
    /// | `COMET_API_KEY`               | --                                 |
    /// | `PROVIDER_REQUEST_TIMEOUT_SECS` | `60`                             |
    ///
    /// # Panics
    ///
    /// Panics if a numeric variable is set but does not parse.
    pub fn from_env() -> Self {
        let request_timeout = Duration::from_secs(env_parse(
            "PROVIDER_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        ));

        let kling = ProviderSettings {
            base_url: env_or("KLING_BASE_URL", DEFAULT_KLING_BASE_URL),
            credential: CredentialSource::Signed {
                access_key: env_secret("KLING_ACCESS_KEY"),
                secret_key: env_secret("KLING_SECRET_KEY"),
                ttl_secs: env_parse("KLING_TOKEN_TTL_SECS", DEFAULT_SIGNED_TTL_SECS),
                skew_secs: env_parse("KLING_TOKEN_SKEW_SECS", DEFAULT_SKEW_SECS),
            },
            request_timeout,
            poll_interval: Duration::from_secs(env_parse("KLING_POLL_INTERVAL_SECS", 5)),
            max_wait: Duration::from_secs(env_parse("KLING_MAX_WAIT_SECS", 900)),
        };

        let suno = ProviderSettings {
            base_url: env_or("SUNO_BASE_URL", DEFAULT_SUNO_BASE_URL),
            credential: CredentialSource::Static {
                key: env_secret("SUNO_API_KEY"),
            },
            request_timeout,
            poll_interval: Duration::from_secs(env_parse("SUNO_POLL_INTERVAL_SECS", 5)),
            max_wait: Duration::from_secs(env_parse("SUNO_MAX_WAIT_SECS", 600)),
        };

        let fal = ProviderSettings {
            base_url: env_or("FAL_BASE_URL", DEFAULT_FAL_BASE_URL),
            credential: CredentialSource::Static {
                key: env_secret("FAL_API_KEY"),
            },
            request_timeout,
            poll_interval: Duration::from_secs(env_parse("FAL_POLL_INTERVAL_SECS", 3)),
            max_wait: Duration::from_secs(env_parse("FAL_MAX_WAIT_SECS", 600)),
        };

        // Synchronous provider: the request timeout is the whole budget.
        let comet = ProviderSettings {
            base_url: env_or("COMET_BASE_URL", DEFAULT_COMET_BASE_URL),
            credential: CredentialSource::Static {
                key: env_secret("COMET_API_KEY"),
            },
            request_timeout: request_timeout.max(Duration::from_secs(120)),
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(180),
        };

        Self {
            kling,
            suno,
            fal,
            comet,
            suno_callback_url: env_secret("SUNO_CALLBACK_URL"),
            fal_3d_model: env_or("FAL_3D_MODEL", DEFAULT_FAL_3D_MODEL),
        }
    }

    /// Settings for a given provider.
    pub fn settings(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::Kling => &self.kling,
            Provider::Suno => &self.suno,
            Provider::Fal => &self.fal,
            Provider::Comet => &self.comet,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{name} must be a valid number: {e}")),
        Err(_) => default,
    }
}
