use axum::Json;
use axum::extract::{Query, State};
use gridclaim_shared::RankingEntry;
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RankingQuery {
    pub limit: Option<usize>,
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "cells": state.cells.len(),
        "seq": state.current_seq(),
        "subscribers": state.event_tx.receiver_count(),
    }))
}

/// `GET /api/ranking`: groups by claimed cell count, descending, ties by name.
pub async fn ranking(
    State(state): State<AppState>,
    Query(query): Query<RankingQuery>,
) -> Json<Vec<RankingEntry>> {
    let mut entries = state.ranking();
    if let Some(limit) = query.limit {
        entries.truncate(limit);
    }
    Json(entries)
}
