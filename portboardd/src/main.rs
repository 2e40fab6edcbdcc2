mod api;
mod config;
mod engine;
mod enrich;
mod icons;
mod overlay;
mod scan;
mod scheduler;
mod snapshot;
mod view;

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::engine::Engine;
use crate::enrich::HttpEnricher;
use crate::icons::IconStore;
use crate::overlay::{OverlayHandle, OverlayStore};
use crate::scan::nmap::NmapScanner;
use crate::snapshot::SnapshotCache;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("portboardd=info"))
        )
        .init();

    tracing::info!("Starting portboardd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/portboard/portboardd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let icons = IconStore::open(config.storage.icon_dir())?;
    tracing::info!("Storing icons in {}", icons.dir().display());

    // A corrupt overlay holds user edits; refuse to start rather than overwrite it
    let overlay_store = OverlayStore::open(config.storage.overlay_path())?;
    tracing::info!("Opened overlay at {:?}", config.storage.overlay_path());
    let overlay = OverlayHandle::spawn(overlay_store);

    let enricher = HttpEnricher::new(&config.enrich, icons.clone())
        .context("Failed to build HTTP client")?;
    let scanner = NmapScanner::new(&config.scan);

    let engine = Arc::new(Engine::new(
        config.scan.range.clone(),
        Arc::new(scanner),
        Arc::new(enricher),
        overlay.clone(),
        SnapshotCache::new(config.storage.cache_path()),
        config.enrich.concurrency,
    ));

    let cancel = CancellationToken::new();

    let scheduler_handle = tokio::spawn(scheduler::run(
        engine.clone(),
        config.scan.interval(),
        cancel.clone(),
    ));

    let app_state = api::routes::AppState {
        overlay: overlay.clone(),
        snapshots: engine.snapshots(),
        cycle: engine.states(),
        icons,
        started: Instant::now(),
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(scheduler_handle, server_handle);

    if let Err(e) = overlay.persist().await {
        tracing::error!("Failed to persist overlay: {}", e);
    }
    if let Err(e) = overlay.shutdown().await {
        tracing::error!("Failed to shutdown overlay: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
