//! Server wiring: state store, pipeline, router, startup reclaim, shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState};
use crate::config::Settings;
use crate::generator::{OpenAiGenerator, PlanGenerator};
use crate::logstream::LogStream;
use crate::pipeline::Pipeline;
use crate::store::{ExecutionStore, StoreHandle};

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Assemble the pipeline and shared state from settings. The generator is
/// injectable so tests can avoid the network.
pub fn build_state(
    settings: &Settings,
    store: StoreHandle,
    generator: Arc<dyn PlanGenerator>,
) -> Arc<AppState> {
    let logs = LogStream::new(store.clone());
    let pipeline = Arc::new(Pipeline::new(settings, store, logs, generator));
    Arc::new(AppState { pipeline })
}

/// Start the orchestrator server and block until shutdown.
pub async fn start_server(settings: Settings, dev_mode: bool) -> Result<()> {
    if let Some(parent) = settings.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = StoreHandle::new(
        ExecutionStore::open(&settings.db_path).context("Failed to open execution store")?,
    );
    let generator: Arc<dyn PlanGenerator> = Arc::new(
        OpenAiGenerator::from_settings(&settings).context("Failed to configure plan generator")?,
    );
    let state = build_state(&settings, store.clone(), generator);

    // Runs from a previous process can never be resumed; mark them failed
    // and sweep their sandboxes before accepting new work.
    let stranded = store.call(|s| s.non_terminal_runs()).await?;
    for run in stranded {
        tracing::warn!("resolving stranded run {} ({})", run.id, run.status);
        let id = run.id.clone();
        store
            .call(move |s| {
                // A queued run never started; it has no failure to record.
                if run.status == crate::models::RunStatus::Queued {
                    Ok(s.transition(&id, crate::models::RunStatus::Cancelled).map(|_| ()))
                } else {
                    Ok(s.fail_run(
                        &id,
                        crate::models::FailureReason::InfraError,
                        "orchestrator restarted while run was in flight",
                    )
                    .map(|_| ()))
                }
            })
            .await??;
    }
    let reclaimed = state
        .pipeline
        .sandboxes()
        .reclaim_orphans(&store)
        .await
        .context("Failed to reclaim orphaned sandboxes")?;
    if reclaimed > 0 {
        tracing::info!("reclaimed {} orphaned sandbox(es)", reclaimed);
    }

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("autobuild listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", e);
        return;
    }
    tracing::info!("shutting down");
}
