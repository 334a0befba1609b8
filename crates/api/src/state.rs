use std::sync::Arc;

use mvstudio_orchestrator::Orchestrator;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// Generation orchestrator (ledger, registry, provider workers).
    pub orchestrator: Arc<Orchestrator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Database pool, absent when running on in-memory stores.
    pub pool: Option<mvstudio_db::DbPool>,
}
