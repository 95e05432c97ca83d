use gridclaim_shared::{Cell, GridGeometry, WorldRect};

use crate::cell_store::CellStore;

/// Receives the current selection for an external panel.
pub trait SelectionSink: Send + Sync + 'static {
    fn selection_changed(&self, selection: &SelectionReport);
}

/// A resolved selection: every selected origin, split into claimed and free.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionReport {
    pub coordinates: Vec<(i64, i64)>,
    pub occupied: Vec<Cell>,
    pub free: Vec<(i64, i64)>,
}

impl SelectionReport {
    pub fn resolve(store: &CellStore, coordinates: Vec<(i64, i64)>) -> Self {
        let mut occupied = Vec::new();
        let mut free = Vec::new();
        for &(x, y) in &coordinates {
            match store.get(x, y) {
                Some(cell) => occupied.push(cell.clone()),
                None => free.push((x, y)),
            }
        }
        Self {
            coordinates,
            occupied,
            free,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }
}

/// Result of tapping a single point.
#[derive(Debug, Clone, PartialEq)]
pub enum HitTest {
    Occupied(Cell),
    Free { x: i64, y: i64 },
    OutsideWorld,
}

/// Drag-to-select and tap-to-select state.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    drag: Option<DragState>,
    selected: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Copy)]
struct DragState {
    start: (i64, i64),
    end: (i64, i64),
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a drag at a world position; clears any finished selection.
    pub fn begin_drag(&mut self, geometry: &GridGeometry, wx: f64, wy: f64) {
        let origin = geometry.snap(wx, wy);
        self.drag = Some(DragState {
            start: origin,
            end: origin,
        });
        self.selected.clear();
    }

    pub fn update_drag(&mut self, geometry: &GridGeometry, wx: f64, wy: f64) {
        if let Some(drag) = &mut self.drag {
            drag.end = geometry.snap(wx, wy);
        }
    }

    /// Finish the drag, selecting every grid origin in the normalized
    /// rectangle. Returns `None` when no drag was active.
    pub fn finish_drag(&mut self, geometry: &GridGeometry, wx: f64, wy: f64) -> Option<&[(i64, i64)]> {
        let mut drag = self.drag.take()?;
        drag.end = geometry.snap(wx, wy);

        let step = geometry.grid_step;
        let (start_x, end_x) = ordered(drag.start.0, drag.end.0);
        let (start_y, end_y) = ordered(drag.start.1, drag.end.1);
        let limit = geometry.world_size;
        let end_x = (end_x + step).min(limit);
        let end_y = (end_y + step).min(limit);

        let columns = ((end_x - start_x) / step).max(0) as usize;
        let rows = ((end_y - start_y) / step).max(0) as usize;
        let mut selected = Vec::with_capacity(columns * rows);
        let mut y = start_y.max(0);
        while y < end_y {
            let mut x = start_x.max(0);
            while x < end_x {
                selected.push((x, y));
                x += step;
            }
            y += step;
        }
        self.selected = selected;
        Some(&self.selected)
    }

    /// Select the cell under a world position. A tap outside the world
    /// clears the selection.
    pub fn tap(&mut self, geometry: &GridGeometry, store: &CellStore, wx: f64, wy: f64) -> HitTest {
        self.drag = None;
        let hit = hit_test(geometry, store, wx, wy);
        self.selected = match &hit {
            HitTest::Occupied(cell) => vec![cell.key()],
            HitTest::Free { x, y } => vec![(*x, *y)],
            HitTest::OutsideWorld => Vec::new(),
        };
        hit
    }

    pub fn clear(&mut self) {
        self.drag = None;
        self.selected.clear();
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    pub fn selected(&self) -> &[(i64, i64)] {
        &self.selected
    }

    /// World rectangle of the drag in progress, one cell past the far corner.
    pub fn drag_rect(&self, geometry: &GridGeometry) -> Option<WorldRect> {
        let drag = self.drag?;
        if drag.start == drag.end {
            return None;
        }
        let step = geometry.grid_step;
        let limit = geometry.world_size as f64;
        let (min_x, max_x) = ordered(drag.start.0, drag.end.0);
        let (min_y, max_y) = ordered(drag.start.1, drag.end.1);
        Some(WorldRect::new(
            min_x as f64,
            min_y as f64,
            ((max_x + step) as f64).min(limit),
            ((max_y + step) as f64).min(limit),
        ))
    }

    /// Bounding box of the finished selection.
    pub fn selection_bounds(&self, geometry: &GridGeometry) -> Option<WorldRect> {
        let step = geometry.grid_step;
        let mut iter = self.selected.iter();
        let &(x, y) = iter.next()?;
        let mut rect = WorldRect::new(x as f64, y as f64, (x + step) as f64, (y + step) as f64);
        for &(x, y) in iter {
            rect.min_x = rect.min_x.min(x as f64);
            rect.min_y = rect.min_y.min(y as f64);
            rect.max_x = rect.max_x.max((x + step) as f64);
            rect.max_y = rect.max_y.max((y + step) as f64);
        }
        Some(rect)
    }
}

/// Classify a world position as a claimed cell, a free cell or off-world.
pub fn hit_test(geometry: &GridGeometry, store: &CellStore, wx: f64, wy: f64) -> HitTest {
    let world = geometry.world_size as f64;
    if !(0.0..world).contains(&wx) || !(0.0..world).contains(&wy) {
        return HitTest::OutsideWorld;
    }
    let (x, y) = geometry.snap(wx, wy);
    match store.get(x, y) {
        Some(cell) => HitTest::Occupied(cell.clone()),
        None => HitTest::Free { x, y },
    }
}

fn ordered(a: i64, b: i64) -> (i64, i64) {
    if a <= b { (a, b) } else { (b, a) }
}
