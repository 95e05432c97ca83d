use std::sync::Arc;
use std::time::Duration;

use gridclaim_client::compositor::{PixelSurface, Surface};
use gridclaim_client::config::{self, EngineConfig, FRAME_INTERVAL_MS, RANKING_REFRESH_SECS};
use gridclaim_client::engine::{Engine, EngineHandle};
use gridclaim_client::fetch::LoadingSink;
use gridclaim_client::http::{HttpRangeSource, build_client, fetch_ranking};
use gridclaim_client::live::run_live_feed;
use gridclaim_shared::GridGeometry;
use tokio::signal;
use tracing_subscriber::EnvFilter;

const RANKING_BOARD_SIZE: usize = 3;

struct LoadingLog;

impl LoadingSink for LoadingLog {
    fn set_loading(&self, loading: bool) {
        if loading {
            tracing::info!("loading chunks");
        } else {
            tracing::info!("all requested chunks settled");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::from_env();
    let geometry = config.geometry;
    let base_url = config::server_url();
    let (width, height) = config::viewport_size();
    tracing::info!(
        %base_url,
        width,
        height,
        world = geometry.world_size,
        chunk = geometry.chunk_size,
        max_concurrent_fetches = config.max_concurrent_fetches,
        "starting gridclaim viewer"
    );

    let client = build_client();
    let source = Arc::new(HttpRangeSource::new(client.clone(), base_url.clone()));
    let (engine, inbox) = Engine::new(config, source, Arc::new(LoadingLog), (width, height));
    let mut engine = engine.with_palette(config::palette());
    engine.fit_to_screen();

    let handle = EngineHandle::spawn(
        engine,
        inbox,
        PixelSurface::new(width, height),
        Duration::from_millis(FRAME_INTERVAL_MS),
    );
    let live = tokio::spawn(run_live_feed(
        client.clone(),
        base_url.clone(),
        handle.live_sender(),
    ));

    let mut ranking_tick = tokio::time::interval(Duration::from_secs(RANKING_REFRESH_SECS));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ranking_tick.tick() => {
                report(&handle, &client, &base_url, &geometry).await;
            }
        }
    }

    live.abort();
    match handle.shutdown().await {
        Ok(surface) => {
            let (w, h) = surface.size();
            tracing::info!(width = w, height = h, "viewer shut down");
        }
        Err(e) => tracing::error!(error = %e, "engine task failed"),
    }
}

async fn report(
    handle: &EngineHandle<PixelSurface>,
    client: &reqwest::Client,
    base_url: &str,
    geometry: &GridGeometry,
) {
    match fetch_ranking(client, base_url).await {
        Ok(ranking) => {
            for (rank, entry) in ranking.iter().take(RANKING_BOARD_SIZE).enumerate() {
                tracing::info!(
                    rank = rank + 1,
                    group = %entry.name,
                    cells = entry.count,
                    share_pct = format!("{:.4}", geometry.share_of_world(entry.count) * 100.0),
                    "ranking"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to refresh ranking"),
    }

    if let Some(stats) = handle.stats().await {
        tracing::info!(
            cells = stats.cells,
            owners = stats.distinct_owners,
            groups = stats.distinct_groups,
            loaded_chunks = stats.loaded_chunks,
            pending_chunks = stats.pending_chunks,
            rasters = stats.cached_rasters,
            clusters = stats.clusters,
            frames = stats.frames,
            "engine stats"
        );
    }
    if let Some(top) = handle.top_groups(RANKING_BOARD_SIZE).await {
        let summary = top
            .iter()
            .map(|entry| format!("{}={}", entry.name, entry.count))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::debug!(%summary, "local top groups");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
