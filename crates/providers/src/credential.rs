//! Provider credential signer.
//!
//! Static-bearer providers get their configured key back unchanged.
//! Signed-token providers get a fresh HS256 JWT with claims
//! `{iss, iat, nbf, exp}` minted on every call. Neither the secret nor a
//! signed token is ever written to logs.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use mvstudio_core::task::{AuthStyle, Provider};
use mvstudio_core::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::config::{CredentialSource, ProvidersConfig};
use crate::error::ProviderError;

/// Claims carried by a signed provider token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedClaims {
    /// Issuer: the provider access key.
    pub iss: String,
    /// Issued-at (UTC epoch seconds).
    pub iat: i64,
    /// Not-before, backdated by the configured skew.
    pub nbf: i64,
    /// Expiry (UTC epoch seconds).
    pub exp: i64,
}

/// Authentication material for one outbound provider call.
#[derive(Clone)]
pub enum ProviderCredential {
    Static {
        token: String,
    },
    Signed {
        token: String,
        issuer: String,
        issued_at: Timestamp,
        not_before: Timestamp,
        expires_at: Timestamp,
    },
}

impl ProviderCredential {
    /// The raw bearer value.
    pub fn bearer(&self) -> &str {
        match self {
            ProviderCredential::Static { token } | ProviderCredential::Signed { token, .. } => {
                token
            }
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.bearer())
    }

    pub fn auth_style(&self) -> AuthStyle {
        match self {
            ProviderCredential::Static { .. } => AuthStyle::StaticBearer,
            ProviderCredential::Signed { .. } => AuthStyle::SignedToken,
        }
    }

    /// Whether the credential is usable at `now`.
    ///
    /// Static credentials are always valid. Signed ones are valid on the
    /// closed interval `[not_before, expires_at]`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            ProviderCredential::Static { .. } => true,
            ProviderCredential::Signed {
                not_before,
                expires_at,
                ..
            } => *not_before <= now && now <= *expires_at,
        }
    }
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderCredential::Static { .. } => f
                .debug_struct("Static")
                .field("token", &"<redacted>")
                .finish(),
            ProviderCredential::Signed {
                issuer,
                issued_at,
                not_before,
                expires_at,
                ..
            } => f
                .debug_struct("Signed")
                .field("token", &"<redacted>")
                .field("issuer", issuer)
                .field("issued_at", issued_at)
                .field("not_before", not_before)
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// Mint an HS256 token for `issuer` valid on `[now - skew, now + ttl]`.
pub fn sign_token(
    issuer: &str,
    secret: &str,
    ttl_secs: i64,
    skew_secs: i64,
    now: DateTime<Utc>,
) -> Result<ProviderCredential, ProviderError> {
    if ttl_secs <= 0 {
        return Err(ProviderError::Signing("token TTL must be positive".into()));
    }
    if skew_secs < 0 {
        return Err(ProviderError::Signing("skew must not be negative".into()));
    }

    // Whole seconds so the returned window matches the encoded claims.
    let issued_at = DateTime::<Utc>::from_timestamp(now.timestamp(), 0)
        .ok_or_else(|| ProviderError::Signing("timestamp out of range".into()))?;
    let not_before = issued_at - Duration::seconds(skew_secs);
    let expires_at = issued_at + Duration::seconds(ttl_secs);

    let claims = SignedClaims {
        iss: issuer.to_string(),
        iat: issued_at.timestamp(),
        nbf: not_before.timestamp(),
        exp: expires_at.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ProviderError::Signing(e.to_string()))?;

    Ok(ProviderCredential::Signed {
        token,
        issuer: issuer.to_string(),
        issued_at,
        not_before,
        expires_at,
    })
}

/// Hands out credentials for outbound provider calls.
#[derive(Clone)]
pub struct CredentialSigner {
    config: Arc<ProvidersConfig>,
}

impl CredentialSigner {
    pub fn new(config: Arc<ProvidersConfig>) -> Self {
        Self { config }
    }

    /// The configured bearer key of a static-bearer provider.
    pub fn static_credential(&self, provider: Provider) -> Result<ProviderCredential, ProviderError> {
        match &self.config.settings(provider).credential {
            CredentialSource::Static { key: Some(key) } => Ok(ProviderCredential::Static {
                token: key.clone(),
            }),
            _ => Err(ProviderError::MissingCredential(provider)),
        }
    }

    /// A freshly minted token for a signed-token provider.
    pub fn signed_credential(
        &self,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<ProviderCredential, ProviderError> {
        let CredentialSource::Signed {
            access_key: Some(access_key),
            secret_key: Some(secret_key),
            ttl_secs,
            skew_secs,
        } = &self.config.settings(provider).credential
        else {
            return Err(ProviderError::MissingCredential(provider));
        };

        let credential = sign_token(access_key, secret_key, *ttl_secs, *skew_secs, now)?;
        tracing::debug!(
            provider = %provider,
            issuer = %access_key,
            ttl_secs,
            "Minted signed provider token",
        );
        Ok(credential)
    }

    /// Credential for `provider` in the style its adapter expects.
    ///
    /// Key material configured for the other style is treated as absent.
    pub fn credential_for(
        &self,
        provider: Provider,
        style: AuthStyle,
    ) -> Result<ProviderCredential, ProviderError> {
        match style {
            AuthStyle::StaticBearer => self.static_credential(provider),
            AuthStyle::SignedToken => self.signed_credential(provider, Utc::now()),
        }
    }

    /// Fail with `MissingCredential` unless `provider` has every key `style`
    /// needs.
    pub fn ensure_configured(&self, provider: Provider, style: AuthStyle) -> Result<(), ProviderError> {
        let source = &self.config.settings(provider).credential;
        if source.auth_style() == style && source.is_configured() {
            Ok(())
        } else {
            Err(ProviderError::MissingCredential(provider))
        }
    }
}
