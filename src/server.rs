use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::{self, AppState, SharedState};
use crate::config::FanoutConfig;
use crate::coordinator::{CoordinatorSettings, RunCoordinator};
use crate::jobs::JobSpecBuilder;
use crate::store::{DbHandle, StateDb};
use crate::substrate::{self, JobBackend};
use crate::workspace::WorkspaceManager;

/// Build the full application router.
pub fn build_router(state: SharedState, cors_permissive: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Wire the coordinator from configuration: state store, workspace manager,
/// job builder and execution substrate.
pub fn build_coordinator(
    config: &FanoutConfig,
    backend: Arc<dyn JobBackend>,
) -> Result<RunCoordinator> {
    std::fs::create_dir_all(&config.storage.output_base).with_context(|| {
        format!(
            "Failed to create output base {}",
            config.storage.output_base.display()
        )
    })?;
    let db = StateDb::new(&config.storage.db_path()).context("Failed to initialize state database")?;

    Ok(RunCoordinator::new(
        CoordinatorSettings::from_config(config),
        WorkspaceManager::new(&config.storage.output_base),
        JobSpecBuilder::from_config(config, |key| std::env::var(key).ok()),
        backend,
        DbHandle::new(db),
    ))
}

/// One maintenance pass: reconcile active runs, then reclaim expired jobs.
pub async fn maintenance_pass(coordinator: &RunCoordinator) {
    match coordinator.sweep().await {
        Ok(runs) => debug!(runs, "Reconciled active runs"),
        Err(e) => warn!(error = %e, "Reconcile sweep failed"),
    }
    let output_base = coordinator.workspace().output_base().to_path_buf();
    match coordinator.backend().reap_finished(&output_base).await {
        Ok(reaped) if !reaped.is_empty() => info!(count = reaped.len(), "Reaped finished jobs"),
        Ok(_) => {}
        Err(e) => warn!(error = %format!("{:#}", e), "Reaping finished jobs failed"),
    }
}

fn spawn_maintenance(
    coordinator: RunCoordinator,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => maintenance_pass(&coordinator).await,
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Start the orchestrator server and run until Ctrl+C.
pub async fn start_server(config: FanoutConfig) -> Result<()> {
    let backend = substrate::from_config(&config)?;
    info!(backend = backend.name(), "Execution substrate ready");
    let coordinator = build_coordinator(&config, backend)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = spawn_maintenance(
        coordinator.clone(),
        Duration::from_secs(config.server.sweep_interval_secs),
        shutdown_rx,
    );

    let state = Arc::new(AppState { coordinator });
    let app = build_router(state, config.server.cors_permissive);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, output_base = %config.storage.output_base.display(), "Fanout orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance task ended abnormally");
    }
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}
