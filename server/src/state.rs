use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use gridclaim_shared::{Cell, GridGeometry, LiveEvent, RankingEntry, RawCell, top_n};
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::{max_batch_claim, sse_broadcast_buffer};

/// Live event serialized once and shared by every subscriber via Arc.
#[derive(Debug, Clone)]
pub struct PreSerializedEvent {
    pub name: &'static str,
    pub seq: u64,
    pub json: Arc<Bytes>,
}

#[derive(Clone)]
pub struct AppState {
    pub geometry: GridGeometry,
    /// Claimed cells keyed by origin. Claims are last-write-wins.
    pub cells: Arc<DashMap<(i64, i64), Cell>>,
    pub next_seq: Arc<AtomicU64>,
    pub event_tx: broadcast::Sender<PreSerializedEvent>,
    pub max_batch_claim: usize,
}

impl AppState {
    pub fn new(geometry: GridGeometry) -> Self {
        Self::with_limits(geometry, sse_broadcast_buffer(), max_batch_claim())
    }

    pub fn with_limits(geometry: GridGeometry, broadcast_buffer: usize, max_batch: usize) -> Self {
        let (event_tx, _) = broadcast::channel(broadcast_buffer.max(1));
        Self {
            geometry,
            cells: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            event_tx,
            max_batch_claim: max_batch,
        }
    }

    /// Store one claim and broadcast it. Returns the event sequence number.
    pub fn claim(&self, cell: Cell) -> u64 {
        let cell = stamp(cell);
        let raw = RawCell::from(&cell);
        self.cells.insert(cell.key(), cell);
        let seq = self.bump_seq();
        self.publish(LiveEvent::Cell { seq, cell: raw });
        seq
    }

    /// Store a batch of claims and broadcast them as a single event.
    pub fn claim_batch(&self, cells: Vec<Cell>) -> Option<u64> {
        if cells.is_empty() {
            return None;
        }
        let mut raws = Vec::with_capacity(cells.len());
        for cell in cells {
            let cell = stamp(cell);
            raws.push(RawCell::from(&cell));
            self.cells.insert(cell.key(), cell);
        }
        let seq = self.bump_seq();
        self.publish(LiveEvent::Cells { seq, cells: raws });
        Some(seq)
    }

    /// Cells with `min_x <= x < max_x` and `min_y <= y < max_y`, ordered by
    /// origin.
    pub fn cells_in_range(&self, min_x: i64, min_y: i64, max_x: i64, max_y: i64) -> Vec<Cell> {
        let mut cells: Vec<Cell> = self
            .cells
            .iter()
            .filter(|entry| {
                let (x, y) = *entry.key();
                (min_x..max_x).contains(&x) && (min_y..max_y).contains(&y)
            })
            .map(|entry| entry.value().clone())
            .collect();
        cells.sort_by_key(|cell| (cell.y, cell.x));
        cells
    }

    pub fn all_cells(&self) -> Vec<Cell> {
        let mut cells: Vec<Cell> = self.cells.iter().map(|entry| entry.value().clone()).collect();
        cells.sort_by_key(|cell| (cell.y, cell.x));
        cells
    }

    /// Groups ordered by claimed cell count. Ungrouped cells are not ranked.
    pub fn ranking(&self) -> Vec<RankingEntry> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for entry in self.cells.iter() {
            if let Some(group) = entry.value().group_id.as_ref() {
                *counts.entry(group.clone()).or_default() += 1;
            }
        }
        let entries: Vec<RankingEntry> = counts
            .into_iter()
            .map(|(name, count)| RankingEntry { name, count })
            .collect();
        let len = entries.len();
        top_n(entries, len)
    }

    pub fn current_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    fn bump_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn publish(&self, event: LiveEvent) {
        let seq = event.seq();
        let name = event.event_name();
        let json = match serde_json::to_vec(&event) {
            Ok(json) => Arc::new(Bytes::from(json)),
            Err(e) => {
                warn!(error = %e, seq, event = name, "failed to serialize live event");
                return;
            }
        };
        // No subscribers is not an error.
        let _ = self.event_tx.send(PreSerializedEvent { name, seq, json });
    }
}

fn stamp(cell: Cell) -> Cell {
    if cell.claimed_at.is_some() {
        cell
    } else {
        cell.with_claimed_at(Utc::now())
    }
}
