//! Handlers for credit balances, ledger history, and operator grants.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use mvstudio_core::error::CoreError;
use mvstudio_core::types::{AccountId, Credits};
use mvstudio_db::models::credit::CreditTransaction;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthAccount;
use crate::response::DataResponse;
use crate::state::AppState;

/// Header carrying the operator token on grant requests.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Maximum ledger entries per page.
const MAX_TRANSACTIONS_LIMIT: i64 = 200;

/// Default page size when no limit is specified.
const DEFAULT_TRANSACTIONS_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct TransactionParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BalanceView {
    pub account_id: AccountId,
    pub balance: Credits,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GrantCredits {
    #[validate(range(min = 1))]
    pub amount: Credits,
}

/// GET /api/v1/credits/balance
pub async fn get_balance(
    auth: AuthAccount,
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<BalanceView>>> {
    let balance = state.orchestrator.balance(auth.account_id).await?;
    Ok(Json(DataResponse {
        data: BalanceView {
            account_id: auth.account_id,
            balance,
        },
    }))
}

/// GET /api/v1/credits/transactions
///
/// The caller's ledger history, newest first.
pub async fn list_transactions(
    auth: AuthAccount,
    State(state): State<AppState>,
    Query(params): Query<TransactionParams>,
) -> AppResult<Json<DataResponse<Vec<CreditTransaction>>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_TRANSACTIONS_LIMIT)
        .clamp(1, MAX_TRANSACTIONS_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let transactions = state
        .orchestrator
        .transactions(auth.account_id, limit, offset)
        .await?;
    Ok(Json(DataResponse { data: transactions }))
}

/// POST /api/v1/admin/credits/{account_id}
///
/// Top up an account. Requires the configured operator token.
pub async fn grant_credits(
    State(state): State<AppState>,
    Path(account_id): Path<AccountId>,
    headers: HeaderMap,
    Json(input): Json<GrantCredits>,
) -> AppResult<Json<DataResponse<BalanceView>>> {
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    match (&state.config.admin_token, presented) {
        (Some(expected), Some(presented)) if expected == presented => {}
        _ => {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Invalid operator token".into(),
            )))
        }
    }

    input.validate()?;
    let balance = state.orchestrator.grant(account_id, input.amount).await?;

    Ok(Json(DataResponse {
        data: BalanceView {
            account_id,
            balance,
        },
    }))
}
