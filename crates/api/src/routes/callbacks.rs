use axum::routing::post;
use axum::Router;

use crate::handlers::callbacks;
use crate::state::AppState;

/// Routes mounted at `/callbacks`.
pub fn router() -> Router<AppState> {
    Router::new().route("/{provider}", post(callbacks::provider_callback))
}
