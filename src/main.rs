use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use switchyard::backend::{Backend, BackendRouter, CliBackend, OpenAiBackend};
use switchyard::resolver::{BackendResolver, ProviderCatalog};
use switchyard::retention::run_maintenance;
use switchyard::*;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _log_guard = switchyard::logging::init_tracing(&args.log_dir, args.json_logs);
    switchyard::logging::setup_panic_hook();

    let mut catalog = match &args.providers {
        Some(path) => match ProviderCatalog::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Failed to load provider catalog: {}", e.inner);
                std::process::exit(1);
            }
        },
        None => {
            tracing::info!("No provider catalog given, using the local CLI provider");
            ProviderCatalog::builtin()
        }
    };
    if let Some(default) = &args.default_provider {
        catalog.default_provider = default.clone();
        if let Err(e) = catalog.validate() {
            tracing::error!("Invalid default provider: {}", e.inner);
            std::process::exit(1);
        }
    }

    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let backend: Arc<dyn Backend> = Arc::new(BackendRouter::new(
        CliBackend::new(args.default_max_turns),
        OpenAiBackend::new(client),
    ));
    let chains = catalog.fallback_chains();
    let resolver: Arc<dyn BackendResolver> = Arc::new(catalog);

    let plan = args.maintenance_plan();
    let removed = plan.sweep_artifacts();
    tracing::debug!("Startup retention sweep removed {} files", removed);

    let cleanup_interval = Duration::from_secs(args.cleanup_interval_secs.max(1));
    let addr = format!("{}:{}", args.host, args.port);
    let state = Arc::new(AppState::build(args, backend, resolver, chains));

    tokio::spawn(run_maintenance(
        plan,
        state.registry.clone(),
        state.metrics.clone(),
        cleanup_interval,
    ));

    let app = switchyard::api::router(state.clone());

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        worker = %state.worker_id,
        default_provider = %state.default_provider(),
        "Switchyard listening on {}",
        addr
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }

    state.metrics.log_summary().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
