pub mod callbacks;
pub mod credits;
pub mod generations;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /generations                    create (requires auth)
/// /generations/{task_id}          get (requires auth, owner only)
///
/// /short-links/{task_id}          resolve (public)
///
/// /credits/balance                caller's balance (requires auth)
/// /admin/credits/{account_id}     grant (operator token)
///
/// /callbacks/{provider}           provider push (callback token)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/generations", generations::router())
        .nest("/short-links", generations::short_link_router())
        .nest("/credits", credits::router())
        .nest("/admin/credits", credits::admin_router())
        .nest("/callbacks", callbacks::router())
}
