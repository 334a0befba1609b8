use std::net::SocketAddr;
use std::sync::Arc;

use mvstudio_api::config::ServerConfig;
use mvstudio_api::router::build_app_router;
use mvstudio_api::state::AppState;
use mvstudio_core::credits::CostTable;
use mvstudio_orchestrator::config::OrchestratorConfig;
use mvstudio_orchestrator::ledger::{CreditLedger, MemoryCreditLedger, PgCreditLedger};
use mvstudio_orchestrator::registry::{MemoryTaskRegistry, PgTaskRegistry, TaskRegistry};
use mvstudio_orchestrator::routing::RoutingTable;
use mvstudio_orchestrator::Orchestrator;
use mvstudio_providers::adapter::AdapterSet;
use mvstudio_providers::config::ProvidersConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mvstudio_api=debug,mvstudio_orchestrator=debug,mvstudio_providers=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let providers = Arc::new(ProvidersConfig::from_env());
    let orchestrator_config = OrchestratorConfig::from_env();

    // --- Stores ---
    let costs = CostTable::default();
    let (pool, ledger, registry) =
        match std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()) {
            Some(database_url) => {
                let pool = mvstudio_db::create_pool(&database_url)
                    .await
                    .expect("Failed to connect to database");
                tracing::info!("Database connection pool created");

                mvstudio_db::health_check(&pool)
                    .await
                    .expect("Database health check failed");

                mvstudio_db::run_migrations(&pool)
                    .await
                    .expect("Failed to run database migrations");
                tracing::info!("Database migrations applied");

                let ledger: Arc<dyn CreditLedger> =
                    Arc::new(PgCreditLedger::new(pool.clone(), costs));
                let registry: Arc<dyn TaskRegistry> = Arc::new(PgTaskRegistry::new(pool.clone()));
                (Some(pool), ledger, registry)
            }
            None => {
                tracing::warn!(
                    "DATABASE_URL not set, using in-memory stores; balances and tasks are lost on restart"
                );
                let ledger: Arc<dyn CreditLedger> = Arc::new(MemoryCreditLedger::new(costs));
                let registry: Arc<dyn TaskRegistry> =
                    Arc::new(MemoryTaskRegistry::new(Arc::clone(&ledger)));
                (None, ledger, registry)
            }
        };

    // --- Providers ---
    let adapters = AdapterSet::from_config(&providers).expect("Failed to build provider clients");
    for provider in mvstudio_core::task::Provider::ALL {
        let credential = &providers.settings(provider).credential;
        let usable = credential.is_configured()
            && adapters
                .get(provider)
                .is_some_and(|adapter| adapter.auth_style() == credential.auth_style());
        if !usable {
            tracing::warn!(provider = %provider, "Provider credential not configured");
        }
    }

    // --- Orchestrator ---
    let orchestrator = Arc::new(Orchestrator::new(
        ledger,
        registry,
        adapters,
        providers,
        RoutingTable::default(),
        orchestrator_config,
    ));

    // The server still starts; unresolved tasks are retried on the next boot.
    match orchestrator.resume_unresolved().await {
        Ok(summary) => tracing::info!(
            resumed = summary.resumed,
            interrupted = summary.interrupted,
            failed = summary.failed,
            "Startup resume finished",
        ),
        Err(e) => tracing::error!(error = %e, "Could not list unresolved generation tasks"),
    }

    // --- App state ---
    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        config: Arc::new(config.clone()),
        pool,
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, stopping lifecycle workers");
    orchestrator.shutdown().await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl-C, starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
