//! Orchestrator server entry point: loads configuration, initializes
//! logging, constructs the `RunStore`/driver/scheduler, and serves the
//! HTTP/SSE surface.

use std::sync::Arc;

use dagrun::config::OrchestratorConfig;
use dagrun::driver::SubprocessDriver;
use dagrun::http::{self, AppState};
use dagrun::plan::resolve_cmd_reference;
use dagrun::scheduler::Scheduler;
use dagrun::{store, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();

    let config = OrchestratorConfig::from_env();
    let store = store::from_env(&config).await;
    let driver = Arc::new(SubprocessDriver::new(Arc::clone(&store)));
    let scheduler = Arc::new(Scheduler::with_defaults(
        Arc::clone(&store),
        driver,
        Arc::new(resolve_cmd_reference),
        config.max_parallelism,
        config.max_retries_default,
        config.backoff_seconds_default,
    )?);

    let state = AppState {
        store,
        scheduler,
        execution_id_header: config.execution_id_header.clone(),
    };
    let app = http::router(state);

    let addr = std::env::var("ORCH_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "dagrund listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
