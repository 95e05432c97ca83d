use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use gridclaim_shared::{Cell, GridGeometry, WorldRect};
use tokio::time::Instant;

use crate::cell_store::CellStore;
use crate::error::RasterError;
use crate::raster::{ChunkRaster, Palette};

/// Chunk coordinates: `(floor(x / C), floor(y / C))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub cx: i64,
    pub cy: i64,
}

impl ChunkKey {
    pub const fn new(cx: i64, cy: i64) -> Self {
        Self { cx, cy }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.cx, self.cy)
    }
}

/// Pure chunk classification of a world coordinate.
pub fn classify(geometry: &GridGeometry, x: i64, y: i64) -> ChunkKey {
    ChunkKey::new(
        x.div_euclid(geometry.chunk_size),
        y.div_euclid(geometry.chunk_size),
    )
}

/// Every chunk whose extent overlaps the half-open rectangle.
///
/// The range on each axis is `floor(min / C) .. ceil(max / C)`; a degenerate
/// rectangle still covers the chunk containing its corner.
pub fn covering_keys(geometry: &GridGeometry, rect: &WorldRect) -> Vec<ChunkKey> {
    let c = geometry.chunk_size as f64;
    let axis = |min: f64, max: f64| {
        let start = (min / c).floor() as i64;
        let end = ((max / c).ceil() as i64).max(start + 1);
        start..end
    };
    let xs = axis(rect.min_x, rect.max_x);
    let ys = axis(rect.min_y, rect.max_y);

    let mut keys = Vec::with_capacity(
        (xs.end - xs.start).max(0) as usize * (ys.end - ys.start).max(0) as usize,
    );
    for cx in xs {
        for cy in ys.clone() {
            keys.push(ChunkKey::new(cx, cy));
        }
    }
    keys
}

/// World extent of a chunk.
pub fn chunk_rect(geometry: &GridGeometry, key: ChunkKey) -> WorldRect {
    let c = geometry.chunk_size;
    WorldRect::new(
        (key.cx * c) as f64,
        (key.cy * c) as f64,
        ((key.cx + 1) * c) as f64,
        ((key.cy + 1) * c) as f64,
    )
}

/// True when no part of the chunk lies inside `[0, W)²`.
pub fn is_outside_world(geometry: &GridGeometry, key: ChunkKey) -> bool {
    let c = geometry.chunk_size;
    let w = geometry.world_size;
    let (min_x, min_y) = (key.cx * c, key.cy * c);
    let (max_x, max_y) = (min_x + c, min_y + c);
    max_x <= 0 || max_y <= 0 || min_x >= w || min_y >= w
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    Pending,
    Loaded,
}

#[derive(Debug, Default)]
pub struct Chunk {
    state: LoadState,
    members: HashSet<(i64, i64)>,
    raster: Option<ChunkRaster>,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Chunk {
    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn raster(&self) -> Option<&ChunkRaster> {
        self.raster.as_ref()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Per-chunk load state, membership index and raster cache.
#[derive(Debug)]
pub struct ChunkDirectory {
    geometry: GridGeometry,
    chunks: HashMap<ChunkKey, Chunk>,
}

impl ChunkDirectory {
    pub fn new(geometry: GridGeometry) -> Self {
        Self {
            geometry,
            chunks: HashMap::new(),
        }
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn classify(&self, x: i64, y: i64) -> ChunkKey {
        classify(&self.geometry, x, y)
    }

    pub fn get(&self, key: ChunkKey) -> Option<&Chunk> {
        self.chunks.get(&key)
    }

    /// Chunks entirely outside the world always report `Loaded` without
    /// ever getting a record.
    pub fn state(&self, key: ChunkKey) -> LoadState {
        if is_outside_world(&self.geometry, key) {
            return LoadState::Loaded;
        }
        self.chunks
            .get(&key)
            .map(|chunk| chunk.state)
            .unwrap_or_default()
    }

    fn entry(&mut self, key: ChunkKey) -> &mut Chunk {
        self.chunks.entry(key).or_default()
    }

    /// Whether a load request for `key` should be issued now.
    pub fn needs_fetch(&self, key: ChunkKey, now: Instant) -> bool {
        if is_outside_world(&self.geometry, key) {
            return false;
        }
        match self.chunks.get(&key) {
            None => true,
            Some(chunk) => match chunk.state {
                LoadState::Loaded | LoadState::Pending => false,
                LoadState::Unloaded => chunk.retry_at.is_none_or(|at| now >= at),
            },
        }
    }

    pub fn mark_pending(&mut self, key: ChunkKey) {
        self.entry(key).state = LoadState::Pending;
    }

    pub fn mark_loaded(&mut self, key: ChunkKey) {
        let chunk = self.entry(key);
        chunk.state = LoadState::Loaded;
        chunk.failures = 0;
        chunk.retry_at = None;
    }

    /// Return a failed chunk to `Unloaded`, eligible again after the backoff.
    /// Returns the consecutive failure count and the backoff applied.
    pub fn mark_failed(
        &mut self,
        key: ChunkKey,
        now: Instant,
        base: Duration,
        max: Duration,
    ) -> (u32, Duration) {
        let chunk = self.entry(key);
        chunk.state = LoadState::Unloaded;
        chunk.failures = chunk.failures.saturating_add(1);
        let backoff = retry_backoff(chunk.failures, base, max);
        chunk.retry_at = if backoff.is_zero() {
            None
        } else {
            Some(now + backoff)
        };
        (chunk.failures, backoff)
    }

    /// Forget the loaded state of every chunk so the next viewport pass
    /// refetches. Rasters are dropped through `invalidate`.
    pub fn unload_all(&mut self) -> Vec<ChunkKey> {
        let mut keys = Vec::new();
        for (key, chunk) in &mut self.chunks {
            if chunk.state == LoadState::Loaded {
                chunk.state = LoadState::Unloaded;
                keys.push(*key);
            }
        }
        keys
    }

    /// Record `cell` as a member of its chunk, moving it out of the chunk the
    /// replaced occupant was filed under. Returns the chunks touched.
    pub fn transfer_membership(&mut self, cell: &Cell, previous: Option<&Cell>) -> Vec<ChunkKey> {
        let mut touched = Vec::with_capacity(2);
        if let Some(old) = previous {
            let old_key = self.classify(old.x, old.y);
            if let Some(chunk) = self.chunks.get_mut(&old_key) {
                chunk.members.remove(&old.key());
            }
            touched.push(old_key);
        }
        let key = self.classify(cell.x, cell.y);
        self.entry(key).members.insert(cell.key());
        if !touched.contains(&key) {
            touched.push(key);
        }
        touched
    }

    pub fn members_of<'a>(&self, key: ChunkKey, store: &'a CellStore) -> Vec<&'a Cell> {
        let Some(chunk) = self.chunks.get(&key) else {
            return Vec::new();
        };
        chunk
            .members
            .iter()
            .filter_map(|&(x, y)| store.get(x, y))
            .collect()
    }

    /// Rebuild the chunk's raster from its current members. The raster is
    /// dropped when the chunk is empty or not loaded.
    pub fn invalidate(
        &mut self,
        key: ChunkKey,
        store: &CellStore,
        palette: &Palette,
    ) -> Result<(), RasterError> {
        let Some(chunk) = self.chunks.get(&key) else {
            return Ok(());
        };
        if chunk.members.is_empty() || chunk.state != LoadState::Loaded {
            if let Some(chunk) = self.chunks.get_mut(&key) {
                chunk.raster = None;
            }
            return Ok(());
        }

        let members = self.members_of(key, store);
        let rendered = ChunkRaster::render(key, &self.geometry, members, palette);
        let chunk = self.entry(key);
        match rendered {
            Ok(raster) => {
                chunk.raster = Some(raster);
                Ok(())
            }
            Err(e) => {
                chunk.raster = None;
                Err(e)
            }
        }
    }

    /// Cached rasters whose chunk overlaps `rect`.
    pub fn rasters_in(&self, rect: &WorldRect) -> Vec<(ChunkKey, &ChunkRaster)> {
        covering_keys(&self.geometry, rect)
            .into_iter()
            .filter_map(|key| {
                self.chunks
                    .get(&key)
                    .and_then(|chunk| chunk.raster.as_ref())
                    .map(|raster| (key, raster))
            })
            .collect()
    }

    pub fn count_in_state(&self, state: LoadState) -> usize {
        self.chunks.values().filter(|c| c.state == state).count()
    }

    /// Chunks with a record: every in-world chunk ever requested or given a
    /// member.
    pub fn tracked_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn cached_raster_count(&self) -> usize {
        self.chunks.values().filter(|c| c.raster.is_some()).count()
    }
}

/// `base * 2^(failures-1)`, capped at `max`.
pub fn retry_backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}
