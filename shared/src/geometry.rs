use serde::{Deserialize, Serialize};

pub const DEFAULT_WORLD_SIZE: i64 = 63_240;
pub const DEFAULT_GRID_STEP: i64 = 20;
pub const DEFAULT_CHUNK_SIZE: i64 = 1_000;

/// Fixed dimensions of the claimable world.
///
/// The world spans `[0, world_size)` on both axes. Valid cell origins are
/// multiples of `grid_step`; chunks are `chunk_size` world units square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub world_size: i64,
    pub grid_step: i64,
    pub chunk_size: i64,
}

impl Default for GridGeometry {
    fn default() -> Self {
        Self {
            world_size: DEFAULT_WORLD_SIZE,
            grid_step: DEFAULT_GRID_STEP,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl GridGeometry {
    /// Returns `None` when any dimension is non-positive or the chunk size is
    /// not a whole number of grid steps.
    pub fn new(world_size: i64, grid_step: i64, chunk_size: i64) -> Option<Self> {
        if world_size <= 0 || grid_step <= 0 || chunk_size <= 0 {
            return None;
        }
        if chunk_size % grid_step != 0 {
            return None;
        }
        Some(Self {
            world_size,
            grid_step,
            chunk_size,
        })
    }

    /// Last valid cell origin on either axis.
    pub fn max_grid_start(&self) -> i64 {
        ((self.world_size - 1) / self.grid_step) * self.grid_step
    }

    /// Number of claimable cells along one axis.
    pub fn cells_per_axis(&self) -> i64 {
        self.world_size / self.grid_step
    }

    /// Total claimable cells in the world.
    pub fn capacity(&self) -> u64 {
        let per_axis = self.cells_per_axis().max(0) as u64;
        per_axis * per_axis
    }

    /// Cells along one side of a chunk.
    pub fn cells_per_chunk_axis(&self) -> usize {
        (self.chunk_size / self.grid_step) as usize
    }

    pub fn is_valid_origin(&self, x: i64, y: i64) -> bool {
        let max = self.max_grid_start();
        (0..=max).contains(&x)
            && (0..=max).contains(&y)
            && x % self.grid_step == 0
            && y % self.grid_step == 0
    }

    /// Snap a world position to the containing cell origin, clamped into the world.
    pub fn snap(&self, wx: f64, wy: f64) -> (i64, i64) {
        let max = self.max_grid_start();
        let snap_axis = |v: f64| {
            let clamped = v.clamp(0.0, self.world_size as f64).floor() as i64;
            ((clamped / self.grid_step) * self.grid_step).clamp(0, max)
        };
        (snap_axis(wx), snap_axis(wy))
    }

    /// Fraction of the world capacity represented by `count` cells.
    pub fn share_of_world(&self, count: u64) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        count as f64 / capacity as f64
    }
}

/// Axis-aligned rectangle in world units, `min` inclusive and `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldRect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl WorldRect {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn intersects(&self, other: &WorldRect) -> bool {
        !(other.max_x < self.min_x
            || other.min_x > self.max_x
            || other.max_y < self.min_y
            || other.min_y > self.max_y)
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_matches_ten_million_cell_world() {
        let g = GridGeometry::default();
        assert_eq!(g.max_grid_start(), 63_220);
        assert_eq!(g.cells_per_axis(), 3_162);
        assert_eq!(g.capacity(), 3_162 * 3_162);
        assert_eq!(g.cells_per_chunk_axis(), 50);
    }

    #[test]
    fn rejects_chunk_not_multiple_of_step() {
        assert!(GridGeometry::new(1000, 20, 1010).is_none());
        assert!(GridGeometry::new(0, 20, 1000).is_none());
        assert!(GridGeometry::new(1000, 20, 100).is_some());
    }

    #[test]
    fn valid_origin_requires_alignment_and_bounds() {
        let g = GridGeometry::default();
        assert!(g.is_valid_origin(0, 0));
        assert!(g.is_valid_origin(63_220, 20));
        assert!(!g.is_valid_origin(63_240, 0));
        assert!(!g.is_valid_origin(-20, 0));
        assert!(!g.is_valid_origin(15, 0));
    }

    #[test]
    fn snap_clamps_into_world() {
        let g = GridGeometry::default();
        assert_eq!(g.snap(39.9, 41.0), (20, 40));
        assert_eq!(g.snap(-5.0, 70_000.0), (0, 63_220));
    }

    #[test]
    fn rect_intersection_is_inclusive_on_touching_edges() {
        let a = WorldRect::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&WorldRect::new(10.0, 0.0, 20.0, 10.0)));
        assert!(!a.intersects(&WorldRect::new(10.5, 0.0, 20.0, 10.0)));
        assert!(a.contains_point(0.0, 9.99));
        assert!(!a.contains_point(10.0, 5.0));
    }
}
