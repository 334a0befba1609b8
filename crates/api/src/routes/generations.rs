//! Route definitions for generations and their short links.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::generations;
use crate::state::AppState;

/// Routes mounted at `/generations`.
///
/// ```text
/// POST   /                -> create_generation
/// GET    /{task_id}       -> get_generation
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(generations::create_generation))
        .route("/{task_id}", get(generations::get_generation))
}

/// Routes mounted at `/short-links`.
pub fn short_link_router() -> Router<AppState> {
    Router::new().route("/{task_id}", get(generations::resolve_short_link))
}
