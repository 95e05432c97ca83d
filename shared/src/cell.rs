use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geometry::GridGeometry;

pub const DEFAULT_CELL_COLOR: &str = "#ffffff";

/// A claimed grid cell. Construct through [`Cell::from_raw`] or [`Cell::new`]
/// so coordinates are always aligned and inside the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub x: i64,
    pub y: i64,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Loosely-typed cell record as it arrives over the wire.
///
/// Coordinates are kept as raw JSON so numeric strings and integral floats can
/// be coerced, and the legacy field names are accepted as aliases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCell {
    #[serde(default)]
    pub x: Value,
    #[serde(default)]
    pub y: Value,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default, alias = "idol_group_name", alias = "groupId")]
    pub group_id: Option<String>,
    #[serde(default, alias = "owner_nickname", alias = "ownerId")]
    pub owner_id: Option<String>,
    #[serde(default, alias = "purchased_at", alias = "claimedAt")]
    pub claimed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    NonNumericCoordinate { axis: char, raw: String },
    OutOfBounds { x: i64, y: i64 },
    Misaligned { x: i64, y: i64, grid_step: i64 },
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonNumericCoordinate { axis, raw } => {
                write!(f, "coordinate {axis} is not numeric: {raw}")
            }
            Self::OutOfBounds { x, y } => write!(f, "cell ({x}, {y}) lies outside the world"),
            Self::Misaligned { x, y, grid_step } => {
                write!(f, "cell ({x}, {y}) is not aligned to grid step {grid_step}")
            }
        }
    }
}

impl std::error::Error for CellError {}

impl Cell {
    pub fn new(geometry: &GridGeometry, x: i64, y: i64, color: &str) -> Result<Self, CellError> {
        validate_origin(geometry, x, y)?;
        Ok(Self {
            x,
            y,
            color: color.to_string(),
            group_id: None,
            owner_id: None,
            claimed_at: None,
        })
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_claimed_at(mut self, claimed_at: DateTime<Utc>) -> Self {
        self.claimed_at = Some(claimed_at);
        self
    }

    /// Validate a wire record into a cell.
    pub fn from_raw(geometry: &GridGeometry, raw: RawCell) -> Result<Self, CellError> {
        let x = coerce_coordinate(&raw.x).ok_or_else(|| CellError::NonNumericCoordinate {
            axis: 'x',
            raw: raw.x.to_string(),
        })?;
        let y = coerce_coordinate(&raw.y).ok_or_else(|| CellError::NonNumericCoordinate {
            axis: 'y',
            raw: raw.y.to_string(),
        })?;
        validate_origin(geometry, x, y)?;

        let claimed_at = raw
            .claimed_at
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Self {
            x,
            y,
            color: raw
                .color
                .filter(|color| !color.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CELL_COLOR.to_string()),
            group_id: non_empty(raw.group_id),
            owner_id: non_empty(raw.owner_id),
            claimed_at,
        })
    }

    pub fn key(&self) -> (i64, i64) {
        (self.x, self.y)
    }
}

impl From<&Cell> for RawCell {
    fn from(cell: &Cell) -> Self {
        Self {
            x: Value::from(cell.x),
            y: Value::from(cell.y),
            color: Some(cell.color.clone()),
            group_id: cell.group_id.clone(),
            owner_id: cell.owner_id.clone(),
            claimed_at: cell.claimed_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// Validate a batch, keeping every well-formed record and counting the rest.
pub fn validate_batch(
    geometry: &GridGeometry,
    raws: impl IntoIterator<Item = RawCell>,
) -> (Vec<Cell>, usize) {
    let mut cells = Vec::new();
    let mut dropped = 0usize;
    for raw in raws {
        match Cell::from_raw(geometry, raw) {
            Ok(cell) => cells.push(cell),
            Err(_) => dropped += 1,
        }
    }
    (cells, dropped)
}

/// Same acceptance as [`GridGeometry::is_valid_origin`], reporting why an
/// origin was rejected.
fn validate_origin(geometry: &GridGeometry, x: i64, y: i64) -> Result<(), CellError> {
    if geometry.is_valid_origin(x, y) {
        return Ok(());
    }
    let max = geometry.max_grid_start();
    if !(0..=max).contains(&x) || !(0..=max).contains(&y) {
        return Err(CellError::OutOfBounds { x, y });
    }
    Err(CellError::Misaligned {
        x,
        y,
        grid_step: geometry.grid_step,
    })
}

fn coerce_coordinate(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral_f64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(integral_f64))
        }
        _ => None,
    }
}

fn integral_f64(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawCell {
        serde_json::from_value(value).expect("raw cell should deserialize")
    }

    #[test]
    fn accepts_legacy_field_names_and_numeric_strings() {
        let g = GridGeometry::default();
        let cell = Cell::from_raw(
            &g,
            raw(json!({
                "x": "40",
                "y": 60.0,
                "color": "#ff0000",
                "idol_group_name": "X",
                "owner_nickname": "alice",
                "purchased_at": "2026-01-02T03:04:05Z"
            })),
        )
        .expect("record should validate");

        assert_eq!(cell.key(), (40, 60));
        assert_eq!(cell.group_id.as_deref(), Some("X"));
        assert_eq!(cell.owner_id.as_deref(), Some("alice"));
        assert!(cell.claimed_at.is_some());
    }

    #[test]
    fn rejects_non_numeric_and_out_of_world() {
        let g = GridGeometry::default();
        assert!(matches!(
            Cell::from_raw(&g, raw(json!({"x": "abc", "y": 0}))),
            Err(CellError::NonNumericCoordinate { axis: 'x', .. })
        ));
        assert!(matches!(
            Cell::from_raw(&g, raw(json!({"x": 0, "y": null}))),
            Err(CellError::NonNumericCoordinate { axis: 'y', .. })
        ));
        assert!(matches!(
            Cell::from_raw(&g, raw(json!({"x": 63_240, "y": 0}))),
            Err(CellError::OutOfBounds { .. })
        ));
        assert!(matches!(
            Cell::from_raw(&g, raw(json!({"x": 21, "y": 0}))),
            Err(CellError::Misaligned { .. })
        ));
        assert!(matches!(
            Cell::from_raw(&g, raw(json!({"x": 20.5, "y": 0}))),
            Err(CellError::NonNumericCoordinate { .. })
        ));
    }

    #[test]
    fn origin_checks_agree_with_geometry() {
        let g = GridGeometry::default();
        let samples = [-20, -1, 0, 15, 20, 63_200, 63_220, 63_230, 63_240, 70_000];
        for &x in &samples {
            for &y in &samples {
                let result = validate_origin(&g, x, y);
                assert_eq!(result.is_ok(), g.is_valid_origin(x, y), "({x}, {y})");
                // bounds are reported ahead of alignment
                if x < 0 || x > 63_220 || y < 0 || y > 63_220 {
                    assert!(matches!(result, Err(CellError::OutOfBounds { .. })), "({x}, {y})");
                }
            }
        }
    }

    #[test]
    fn blank_group_and_color_are_normalized() {
        let g = GridGeometry::default();
        let cell = Cell::from_raw(&g, raw(json!({"x": 0, "y": 0, "group_id": "  ", "color": ""})))
            .expect("record should validate");
        assert_eq!(cell.group_id, None);
        assert_eq!(cell.color, DEFAULT_CELL_COLOR);
    }

    #[test]
    fn batch_validation_drops_only_bad_records() {
        let g = GridGeometry::default();
        let (cells, dropped) = validate_batch(
            &g,
            vec![
                raw(json!({"x": 0, "y": 0})),
                raw(json!({"x": "nope", "y": 0})),
                raw(json!({"x": 20, "y": 20})),
            ],
        );
        assert_eq!(cells.len(), 2);
        assert_eq!(dropped, 1);
    }
}
