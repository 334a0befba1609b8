//! JWT-based account extractor for Axum handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use mvstudio_core::error::CoreError;
use mvstudio_core::types::AccountId;

use crate::auth::jwt::validate_token;
use crate::error::AppError;
use crate::state::AppState;

/// Account authenticated by a JWT Bearer token in the `Authorization` header.
///
/// Every credit-bearing handler takes this extractor; the account it names
/// is the one debited.
#[derive(Debug, Clone)]
pub struct AuthAccount {
    pub account_id: AccountId,
}

impl FromRequestParts<AppState> for AuthAccount {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized(
                    "Missing Authorization header".into(),
                ))
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Invalid Authorization format. Expected: Bearer <token>".into(),
            ))
        })?;

        let claims = validate_token(token, &state.config.jwt).map_err(|_| {
            AppError::Core(CoreError::Unauthorized("Invalid or expired token".into()))
        })?;

        Ok(AuthAccount {
            account_id: claims.sub,
        })
    }
}
