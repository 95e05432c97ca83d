use serde::{Deserialize, Serialize};

use crate::cell::RawCell;

/// Live-update payloads broadcast to subscribers after claims are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Cell {
        #[serde(default)]
        seq: u64,
        cell: RawCell,
    },
    Cells {
        #[serde(default)]
        seq: u64,
        cells: Vec<RawCell>,
    },
    /// The subscriber missed events and should refetch what it has loaded.
    Resync {
        #[serde(default)]
        seq: u64,
    },
}

impl LiveEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Cell { seq, .. } | Self::Cells { seq, .. } | Self::Resync { seq } => *seq,
        }
    }

    /// SSE `event:` name used for this payload.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Cell { .. } => "cell",
            Self::Cells { .. } => "cells",
            Self::Resync { .. } => "resync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub name: String,
    pub count: u64,
}

/// Sort ranking entries by count descending, then name ascending, and keep `n`.
pub fn top_n(mut entries: Vec<RankingEntry>, n: usize) -> Vec<RankingEntry> {
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    entries.truncate(n);
    entries
}
