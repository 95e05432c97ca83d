use gridclaim_shared::WorldRect;

/// Viewport manages the pan/zoom transformation from world coordinates to screen coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pub offset_x: f64,
    pub offset_y: f64,
    pub scale: f64,
}

pub const MIN_SCALE: f64 = 0.01;
pub const MAX_SCALE: f64 = 5.0;
const WHEEL_ZOOM_IN: f64 = 1.1;
const WHEEL_ZOOM_OUT: f64 = 0.9;
const PINCH_SENSITIVITY: f64 = 0.005;
const FIT_PADDING_PX: f64 = 60.0;
const FIT_LIFT_FRACTION: f64 = 0.05;
/// Screen pixels of slack kept around the visible rectangle.
const VISIBLE_MARGIN_PX: f64 = 100.0;
/// Pointer distance from a canvas edge that starts auto-pan during a drag.
pub const EDGE_PAN_THRESHOLD_PX: f64 = 50.0;
/// Screen pixels panned per frame while the pointer sits in the edge band.
pub const EDGE_PAN_STEP_PX: f64 = 10.0;
/// Side of the square overview map, in screen pixels.
pub const MINIMAP_SIZE_PX: f64 = 180.0;

/// The visible window drawn on the overview map, in minimap pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimapRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            scale: 0.2,
        }
    }
}

impl Viewport {
    /// Convert world coordinates to screen coordinates.
    pub fn world_to_screen(&self, wx: f64, wy: f64) -> (f64, f64) {
        (
            wx * self.scale + self.offset_x,
            wy * self.scale + self.offset_y,
        )
    }

    /// Convert screen coordinates to world coordinates.
    pub fn screen_to_world(&self, sx: f64, sy: f64) -> (f64, f64) {
        (
            (sx - self.offset_x) / self.scale,
            (sy - self.offset_y) / self.scale,
        )
    }

    /// Rescale about a fixed screen point, clamping to the zoom range.
    fn rescale_about(&mut self, factor: f64, screen_x: f64, screen_y: f64) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let new_scale = (self.scale * factor).clamp(MIN_SCALE, MAX_SCALE);
        let ratio = new_scale / self.scale;

        // Adjust offset so the point under the cursor stays fixed
        self.offset_x = screen_x - (screen_x - self.offset_x) * ratio;
        self.offset_y = screen_y - (screen_y - self.offset_y) * ratio;
        self.scale = new_scale;
    }

    /// Wheel zoom toward the cursor: one fixed step per notch.
    pub fn zoom_at(&mut self, wheel_delta: f64, screen_x: f64, screen_y: f64) {
        let factor = if wheel_delta > 0.0 {
            WHEEL_ZOOM_OUT
        } else {
            WHEEL_ZOOM_IN
        };
        self.rescale_about(factor, screen_x, screen_y);
    }

    /// Pinch zoom about the viewport centre. `distance_delta` is the change in
    /// finger separation in screen pixels since the last move.
    pub fn pinch(&mut self, distance_delta: f64, canvas_w: f64, canvas_h: f64) {
        let factor = 1.0 + distance_delta * PINCH_SENSITIVITY;
        self.rescale_about(factor, canvas_w / 2.0, canvas_h / 2.0);
    }

    /// Pan by screen-space delta.
    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.offset_x += dx;
        self.offset_y += dy;
    }

    /// Fit the whole world into the canvas, centred and lifted slightly.
    pub fn fit_to_screen(&mut self, world_size: f64, canvas_w: f64, canvas_h: f64) {
        if world_size <= 0.0 || canvas_w <= 0.0 || canvas_h <= 0.0 {
            return;
        }
        let available_w = (canvas_w - FIT_PADDING_PX * 2.0).max(1.0);
        let available_h = (canvas_h - FIT_PADDING_PX * 2.0).max(1.0);
        self.scale = (available_w / world_size)
            .min(available_h / world_size)
            .clamp(MIN_SCALE, MAX_SCALE);

        self.offset_x = (canvas_w - world_size * self.scale) / 2.0;
        self.offset_y =
            (canvas_h - world_size * self.scale) / 2.0 - canvas_h * FIT_LIFT_FRACTION;
    }

    /// Pan toward whichever canvas edges the pointer is near, so dragging a
    /// selection past the edge keeps scrolling the map. Returns whether the
    /// viewport moved.
    pub fn edge_pan(&mut self, pointer_x: f64, pointer_y: f64, canvas_w: f64, canvas_h: f64) -> bool {
        let step = |pos: f64, extent: f64| {
            if pos > extent - EDGE_PAN_THRESHOLD_PX {
                -EDGE_PAN_STEP_PX
            } else if pos < EDGE_PAN_THRESHOLD_PX {
                EDGE_PAN_STEP_PX
            } else {
                0.0
            }
        };
        let dx = step(pointer_x, canvas_w);
        let dy = step(pointer_y, canvas_h);
        if dx == 0.0 && dy == 0.0 {
            return false;
        }
        self.pan(dx, dy);
        true
    }

    /// Where the canvas window sits on a `minimap_px` square overview of the
    /// whole world.
    pub fn minimap_rect(
        &self,
        world_size: f64,
        canvas_w: f64,
        canvas_h: f64,
        minimap_px: f64,
    ) -> MinimapRect {
        let mm_scale = minimap_px / world_size;
        MinimapRect {
            left: -self.offset_x / self.scale * mm_scale,
            top: -self.offset_y / self.scale * mm_scale,
            width: canvas_w / self.scale * mm_scale,
            height: canvas_h / self.scale * mm_scale,
        }
    }

    /// World rectangle covered by the canvas, padded by a fixed screen margin.
    pub fn visible_rect(&self, canvas_w: f64, canvas_h: f64) -> WorldRect {
        let margin = VISIBLE_MARGIN_PX / self.scale;
        let (min_x, min_y) = self.screen_to_world(0.0, 0.0);
        let (max_x, max_y) = self.screen_to_world(canvas_w, canvas_h);
        WorldRect::new(
            min_x - margin,
            min_y - margin,
            max_x + margin,
            max_y + margin,
        )
    }
}
