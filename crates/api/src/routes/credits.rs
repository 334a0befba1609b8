use axum::routing::{get, post};
use axum::Router;

use crate::handlers::credits;
use crate::state::AppState;

/// Routes mounted at `/credits`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/balance", get(credits::get_balance))
        .route("/transactions", get(credits::list_transactions))
}

/// Routes mounted at `/admin/credits`.
pub fn admin_router() -> Router<AppState> {
    Router::new().route("/{account_id}", post(credits::grant_credits))
}
