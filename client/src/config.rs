use std::time::Duration;

use gridclaim_shared::geometry::{DEFAULT_CHUNK_SIZE, DEFAULT_GRID_STEP, DEFAULT_WORLD_SIZE};
use gridclaim_shared::{GridGeometry, parse_css_color};

use crate::raster::Palette;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 6;
pub const DEFAULT_CLUSTER_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_FETCH_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_FETCH_RETRY_MAX_MS: u64 = 10_000;
pub const DEFAULT_LIVE_EVENT_BUFFER: usize = 1024;
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 720;
pub const RANKING_REFRESH_SECS: u64 = 5;
pub const FRAME_INTERVAL_MS: u64 = 16;
pub const LIVE_RECONNECT_BASE_MS: u64 = 500;
pub const LIVE_RECONNECT_MAX_MS: u64 = 10_000;

/// Tunables for the chunk streaming engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub geometry: GridGeometry,
    pub max_concurrent_fetches: usize,
    pub cluster_debounce: Duration,
    pub fetch_timeout: Duration,
    pub fetch_retry_base: Duration,
    pub fetch_retry_max: Duration,
    pub live_event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            geometry: GridGeometry::default(),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            cluster_debounce: Duration::from_millis(DEFAULT_CLUSTER_DEBOUNCE_MS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            fetch_retry_base: Duration::from_millis(DEFAULT_FETCH_RETRY_BASE_MS),
            fetch_retry_max: Duration::from_millis(DEFAULT_FETCH_RETRY_MAX_MS),
            live_event_buffer: DEFAULT_LIVE_EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            geometry: geometry(),
            max_concurrent_fetches: env_positive("MAX_CONCURRENT_FETCHES")
                .unwrap_or(DEFAULT_MAX_CONCURRENT_FETCHES),
            cluster_debounce: Duration::from_millis(
                env_positive("CLUSTER_DEBOUNCE_MS").unwrap_or(DEFAULT_CLUSTER_DEBOUNCE_MS),
            ),
            fetch_timeout: Duration::from_secs(
                env_positive("FETCH_TIMEOUT_SECS").unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
            fetch_retry_base: Duration::from_millis(
                env_positive("FETCH_RETRY_BASE_MS").unwrap_or(DEFAULT_FETCH_RETRY_BASE_MS),
            ),
            fetch_retry_max: Duration::from_millis(
                env_positive("FETCH_RETRY_MAX_MS").unwrap_or(DEFAULT_FETCH_RETRY_MAX_MS),
            ),
            live_event_buffer: env_positive("LIVE_EVENT_BUFFER")
                .unwrap_or(DEFAULT_LIVE_EVENT_BUFFER),
        }
    }
}

pub fn server_url() -> String {
    std::env::var("GRIDCLAIM_SERVER_URL")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
}

/// World geometry from `WORLD_SIZE`, `GRID_STEP` and `CHUNK_SIZE`.
/// An inconsistent combination falls back to the defaults as a whole.
pub fn geometry() -> GridGeometry {
    let world = env_positive("WORLD_SIZE").unwrap_or(DEFAULT_WORLD_SIZE);
    let step = env_positive("GRID_STEP").unwrap_or(DEFAULT_GRID_STEP);
    let chunk = env_positive("CHUNK_SIZE").unwrap_or(DEFAULT_CHUNK_SIZE);
    GridGeometry::new(world, step, chunk).unwrap_or_else(|| {
        tracing::warn!(
            world,
            step,
            chunk,
            "chunk size is not a multiple of the grid step; using default geometry"
        );
        GridGeometry::default()
    })
}

/// Per-group fill overrides from `GROUP_COLORS`, written as
/// `Name=color` entries separated by `;`. Colors take any CSS form the
/// renderer understands. Malformed entries are skipped with a warning.
pub fn palette() -> Palette {
    let Ok(value) = std::env::var("GROUP_COLORS") else {
        return Palette::new();
    };
    let mut palette = Palette::new();
    for entry in value.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = entry.split_once('=').and_then(|(name, color)| {
            let name = name.trim();
            let color = parse_css_color(color.trim())?;
            (!name.is_empty()).then_some((name, color))
        });
        match parsed {
            Some((name, color)) => palette = palette.with_group(name, color),
            None => tracing::warn!(entry, "ignoring malformed GROUP_COLORS entry"),
        }
    }
    palette
}

pub fn viewport_size() -> (u32, u32) {
    (
        env_positive("VIEWPORT_WIDTH").unwrap_or(DEFAULT_VIEWPORT_WIDTH),
        env_positive("VIEWPORT_HEIGHT").unwrap_or(DEFAULT_VIEWPORT_HEIGHT),
    )
}

fn env_positive<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}
