use anyhow::{Context, Result, bail};
use std::{io::ErrorKind, net::SocketAddr};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod test_support;

use routes::rate_limit::{RateLimitSettings, RateLimitState};
use services::{
    artifact_store::ArtifactStore, engine::EngineInvoker, job_tracker::JobTracker,
    pipeline::TransformService, sweeper::RetentionSweeper,
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-forge with config: {:?}", cfg);

    // --- Artifact store (creates the directory if needed) ---
    let store = ArtifactStore::open(&cfg.storage_dir, cfg.max_upload_bytes, cfg.max_age)
        .await
        .with_context(|| format!("opening storage directory {}", cfg.storage_dir))?;
    tracing::info!("Storing files in {}", store.root().display());

    // --- Engines ---
    let invoker = EngineInvoker::from_config(&cfg, store.root());
    let missing: Vec<&str> = invoker
        .preflight()
        .await
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|_| name))
        .collect();
    if !missing.is_empty() {
        if cfg.allow_missing_engines {
            tracing::warn!(
                "Continuing without {}; matching requests will fail",
                missing.join(", ")
            );
        } else {
            bail!(
                "engine(s) unavailable: {} (pass --allow-missing-engines to start anyway)",
                missing.join(", ")
            );
        }
    }

    // --- Core services ---
    let tracker = JobTracker::new();
    let transforms = TransformService::new(store.clone(), tracker.clone(), invoker);
    let sweeper =
        RetentionSweeper::new(store, tracker, cfg.sweep_interval, cfg.max_age).start();

    // --- Build router ---
    let rate_limit = RateLimitState::new(RateLimitSettings {
        max_requests: cfg.rate_limit_max,
        window: cfg.rate_limit_window,
    })
    .context("rate limit window is too short for the request quota")?;
    let pruner = rate_limit.spawn_pruner(cfg.rate_limit_window);
    let app = routes::routes::app(
        AppState::new(transforms, cfg.max_files),
        rate_limit,
        cfg.body_limit(),
    );

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown())
    .await;

    pruner.abort();
    sweeper.stop().await;
    served?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. A signal that cannot be installed is
/// logged and never fires.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl+C received, shutting down"),
            Err(err) => {
                tracing::warn!("failed to capture Ctrl+C: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                tracing::info!("SIGTERM received, shutting down");
            }
            Err(err) => {
                tracing::warn!("failed to capture SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}
