use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use gridclaim_shared::{Cell, RawCell, validate_batch};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MAX_RANGE_CHUNKS;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub seq: u64,
    pub cell: Cell,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchClaimResponse {
    pub accepted: usize,
    pub dropped: usize,
    pub seq: Option<u64>,
}

/// `GET /api/cells/chunk`: cells whose origin lies in the half-open range.
pub async fn get_chunk(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<Cell>>, (StatusCode, String)> {
    validate_range(&state, &query)?;
    let cells = state.cells_in_range(query.min_x, query.min_y, query.max_x, query.max_y);
    debug!(
        min_x = query.min_x,
        min_y = query.min_y,
        count = cells.len(),
        "served range query"
    );
    Ok(Json(cells))
}

/// `GET /api/cells`: every claimed cell.
pub async fn get_all(State(state): State<AppState>) -> Json<Vec<Cell>> {
    Json(state.all_cells())
}

/// `POST /api/cells`: claim one cell.
pub async fn claim_cell(
    State(state): State<AppState>,
    Json(raw): Json<RawCell>,
) -> Result<(StatusCode, Json<ClaimResponse>), (StatusCode, String)> {
    let cell = Cell::from_raw(&state.geometry, raw).map_err(|e| {
        debug!(error = %e, "rejected malformed claim");
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;
    let seq = state.claim(cell.clone());
    Ok((StatusCode::CREATED, Json(ClaimResponse { seq, cell })))
}

/// `POST /api/cells/batch`: claim many cells. Malformed records are dropped
/// and counted; the rest are stored and broadcast as one event.
pub async fn claim_batch(
    State(state): State<AppState>,
    Json(raws): Json<Vec<RawCell>>,
) -> Result<Json<BatchClaimResponse>, (StatusCode, String)> {
    if raws.len() > state.max_batch_claim {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "batch of {} cells exceeds the limit of {}",
                raws.len(),
                state.max_batch_claim
            ),
        ));
    }
    let (cells, dropped) = validate_batch(&state.geometry, raws);
    if dropped > 0 {
        warn!(dropped, accepted = cells.len(), "dropped malformed cells from batch claim");
    }
    let accepted = cells.len();
    let seq = state.claim_batch(cells);
    Ok(Json(BatchClaimResponse {
        accepted,
        dropped,
        seq,
    }))
}

fn validate_range(state: &AppState, query: &RangeQuery) -> Result<(), (StatusCode, String)> {
    if query.max_x <= query.min_x || query.max_y <= query.min_y {
        return Err((StatusCode::BAD_REQUEST, "range is empty or inverted".to_string()));
    }
    let max_span = MAX_RANGE_CHUNKS * state.geometry.chunk_size;
    let span_x = query.max_x.saturating_sub(query.min_x);
    let span_y = query.max_y.saturating_sub(query.min_y);
    if span_x > max_span || span_y > max_span {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("range spans more than {max_span} world units"),
        ));
    }
    Ok(())
}
