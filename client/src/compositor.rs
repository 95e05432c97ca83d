use gridclaim_shared::{GridGeometry, Rgba, WorldRect};

use crate::chunks::{ChunkKey, chunk_rect};
use crate::cluster::Cluster;
use crate::label_layout::place_label;
use crate::raster::ChunkRaster;
use crate::viewport::Viewport;

const BACKGROUND: Rgba = Rgba::opaque(0x0a, 0x0f, 0x19);
const WORLD_BORDER: Rgba = Rgba::opaque(0x33, 0x33, 0x33);
const WORLD_BORDER_PX: f64 = 10.0;
const MID_ZONE_HALF: f64 = 12_000.0;
const CORE_ZONE_HALF: f64 = 2_000.0;
const OVERLAY_STROKE_PX: f64 = 2.0;
/// Grid lines, zone borders and similar detail appear above this scale.
const DETAIL_SCALE: f64 = 0.05;

fn mid_zone_fill() -> Rgba {
    Rgba::with_alpha_f(0, 100, 255, 0.05)
}
fn core_zone_fill() -> Rgba {
    Rgba::with_alpha_f(255, 215, 0, 0.08)
}
fn core_zone_border() -> Rgba {
    Rgba::with_alpha_f(255, 215, 0, 0.3)
}
fn grid_line() -> Rgba {
    Rgba::with_alpha_f(255, 255, 255, 0.08)
}
fn label_fill() -> Rgba {
    Rgba::with_alpha_f(255, 255, 255, 0.9)
}

/// A 2-D drawing target in screen pixels.
pub trait Surface {
    fn size(&self) -> (u32, u32);

    fn clear(&mut self, color: Rgba);

    /// Blend a filled rectangle over the current contents.
    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: Rgba);

    /// Outline centred on the rectangle's edges.
    fn stroke_rect(&mut self, x: f64, y: f64, w: f64, h: f64, line_width: f64, color: Rgba) {
        let half = line_width / 2.0;
        self.fill_rect(x - half, y - half, w + line_width, line_width, color);
        self.fill_rect(x - half, y + h - half, w + line_width, line_width, color);
        self.fill_rect(x - half, y + half, line_width, h - line_width, color);
        self.fill_rect(x + w - half, y + half, line_width, h - line_width, color);
    }

    /// Scale a chunk raster into the destination rectangle, nearest neighbour.
    fn draw_raster(&mut self, raster: &ChunkRaster, x: f64, y: f64, w: f64, h: f64);

    /// Centred text run.
    fn fill_text(&mut self, text: &str, x: f64, y: f64, font_px: f64, color: Rgba);
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub font_px: f64,
    pub color: Rgba,
}

/// Software RGBA surface. Text is not rasterized; runs are recorded for a
/// host text renderer to draw on top.
#[derive(Debug, Clone)]
pub struct PixelSurface {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
    text_runs: Vec<TextRun>,
}

impl PixelSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![Rgba::TRANSPARENT.to_u32(); width as usize * height as usize],
            text_runs: Vec::new(),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Rgba {
        if x >= self.width || y >= self.height {
            return Rgba::TRANSPARENT;
        }
        Rgba::from_u32(self.pixels[(y * self.width + x) as usize])
    }

    pub fn text_runs(&self) -> &[TextRun] {
        &self.text_runs
    }

    /// Raw RGBA bytes, row-major.
    pub fn to_rgba_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_be_bytes()).collect()
    }

    fn clip_span(&self, start: f64, len: f64, limit: u32) -> Option<(u32, u32)> {
        if !start.is_finite() || !len.is_finite() || len <= 0.0 {
            return None;
        }
        let lo = start.floor().max(0.0);
        let hi = (start + len).ceil().min(limit as f64);
        if hi <= lo {
            return None;
        }
        Some((lo as u32, hi as u32))
    }

    fn blend(&mut self, x: u32, y: u32, color: Rgba) {
        let idx = (y * self.width + x) as usize;
        let dst = Rgba::from_u32(self.pixels[idx]);
        self.pixels[idx] = color.over(dst).to_u32();
    }
}

impl Surface for PixelSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self, color: Rgba) {
        self.pixels.fill(color.to_u32());
        self.text_runs.clear();
    }

    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: Rgba) {
        if color.a == 0 {
            return;
        }
        let Some((x0, x1)) = self.clip_span(x, w, self.width) else {
            return;
        };
        let Some((y0, y1)) = self.clip_span(y, h, self.height) else {
            return;
        };
        for py in y0..y1 {
            for px in x0..x1 {
                self.blend(px, py, color);
            }
        }
    }

    fn draw_raster(&mut self, raster: &ChunkRaster, x: f64, y: f64, w: f64, h: f64) {
        let side = raster.side();
        if side == 0 {
            return;
        }
        let Some((x0, x1)) = self.clip_span(x, w, self.width) else {
            return;
        };
        let Some((y0, y1)) = self.clip_span(y, h, self.height) else {
            return;
        };
        for py in y0..y1 {
            let v = (py as f64 + 0.5 - y) / h;
            if !(0.0..1.0).contains(&v) {
                continue;
            }
            let ty = (v * side as f64) as usize;
            for px in x0..x1 {
                let u = (px as f64 + 0.5 - x) / w;
                if !(0.0..1.0).contains(&u) {
                    continue;
                }
                let texel = raster.texel((u * side as f64) as usize, ty);
                if texel.a != 0 {
                    self.blend(px, py, texel);
                }
            }
        }
    }

    fn fill_text(&mut self, text: &str, x: f64, y: f64, font_px: f64, color: Rgba) {
        self.text_runs.push(TextRun {
            text: text.to_string(),
            x,
            y,
            font_px,
            color,
        });
    }
}

/// Everything one frame draws, in world units.
pub struct Scene<'a> {
    pub geometry: &'a GridGeometry,
    pub viewport: &'a Viewport,
    pub visible: WorldRect,
    pub rasters: Vec<(ChunkKey, &'a ChunkRaster)>,
    pub clusters: &'a [Cluster],
    pub drag_rect: Option<WorldRect>,
    pub selection_bounds: Option<WorldRect>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub rasters_drawn: usize,
    pub labels_drawn: usize,
    pub grid_lines: usize,
}

/// Paint one frame: background, zone overlays, grid, world border, chunk
/// rasters, cluster labels, then selection overlays.
pub fn composite(surface: &mut dyn Surface, scene: &Scene<'_>) -> FrameStats {
    let mut stats = FrameStats::default();
    let vp = scene.viewport;
    let world = scene.geometry.world_size as f64;
    let detail = vp.scale > DETAIL_SCALE;

    surface.clear(Rgba::TRANSPARENT);
    fill_world_rect(surface, vp, &WorldRect::new(0.0, 0.0, world, world), BACKGROUND);

    let centre = world / 2.0;
    let mid = centred(centre, MID_ZONE_HALF);
    let core = centred(centre, CORE_ZONE_HALF);
    fill_world_rect(surface, vp, &mid, mid_zone_fill());
    fill_world_rect(surface, vp, &core, core_zone_fill());
    if detail {
        stroke_world_rect(surface, vp, &core, OVERLAY_STROKE_PX, core_zone_border());
    }

    if detail {
        stats.grid_lines = draw_grid(surface, scene);
    }

    stroke_world_rect(
        surface,
        vp,
        &WorldRect::new(0.0, 0.0, world, world),
        WORLD_BORDER_PX,
        WORLD_BORDER,
    );

    for (key, raster) in &scene.rasters {
        let rect = chunk_rect(scene.geometry, *key);
        let (sx, sy) = vp.world_to_screen(rect.min_x, rect.min_y);
        surface.draw_raster(
            raster,
            sx,
            sy,
            rect.width() * vp.scale,
            rect.height() * vp.scale,
        );
        stats.rasters_drawn += 1;
    }

    for cluster in scene.clusters {
        let Some(label) = place_label(cluster, &scene.visible, vp.scale) else {
            continue;
        };
        let (sx, sy) = vp.world_to_screen(label.world_x, label.world_y);
        surface.fill_text(&label.text, sx, sy, label.world_font_size * vp.scale, label_fill());
        stats.labels_drawn += 1;
    }

    if let Some(rect) = scene.drag_rect {
        let lime = Rgba::opaque(0, 255, 0);
        fill_world_rect(surface, vp, &rect, Rgba::with_alpha_f(0, 255, 0, 0.1));
        stroke_world_rect(surface, vp, &rect, OVERLAY_STROKE_PX, lime);
    }
    if let Some(rect) = scene.selection_bounds {
        let yellow = Rgba::opaque(255, 255, 0);
        fill_world_rect(surface, vp, &rect, Rgba::with_alpha_f(255, 255, 0, 0.1));
        stroke_world_rect(surface, vp, &rect, OVERLAY_STROKE_PX, yellow);
    }

    stats
}

fn centred(centre: f64, half: f64) -> WorldRect {
    WorldRect::new(centre - half, centre - half, centre + half, centre + half)
}

fn fill_world_rect(surface: &mut dyn Surface, vp: &Viewport, rect: &WorldRect, color: Rgba) {
    let (sx, sy) = vp.world_to_screen(rect.min_x, rect.min_y);
    surface.fill_rect(sx, sy, rect.width() * vp.scale, rect.height() * vp.scale, color);
}

fn stroke_world_rect(
    surface: &mut dyn Surface,
    vp: &Viewport,
    rect: &WorldRect,
    line_px: f64,
    color: Rgba,
) {
    let (sx, sy) = vp.world_to_screen(rect.min_x, rect.min_y);
    surface.stroke_rect(
        sx,
        sy,
        rect.width() * vp.scale,
        rect.height() * vp.scale,
        line_px,
        color,
    );
}

/// One-pixel grid lines over the visible part of the world.
fn draw_grid(surface: &mut dyn Surface, scene: &Scene<'_>) -> usize {
    let vp = scene.viewport;
    let step = scene.geometry.grid_step as f64;
    let world = scene.geometry.world_size as f64;
    let start_x = ((scene.visible.min_x / step).floor() * step).max(0.0);
    let start_y = ((scene.visible.min_y / step).floor() * step).max(0.0);
    let end_x = ((scene.visible.max_x / step).ceil() * step).min(world);
    let end_y = ((scene.visible.max_y / step).ceil() * step).min(world);
    if end_x <= start_x || end_y <= start_y {
        return 0;
    }

    let color = grid_line();
    let (sx0, sy0) = vp.world_to_screen(start_x, start_y);
    let (sx1, sy1) = vp.world_to_screen(end_x, end_y);
    let mut lines = 0;

    let mut x = start_x;
    while x <= end_x {
        let (sx, _) = vp.world_to_screen(x, 0.0);
        surface.fill_rect(sx, sy0, 1.0, sy1 - sy0, color);
        lines += 1;
        x += step;
    }
    let mut y = start_y;
    while y <= end_y {
        let (_, sy) = vp.world_to_screen(0.0, y);
        surface.fill_rect(sx0, sy, sx1 - sx0, 1.0, color);
        lines += 1;
        y += step;
    }
    lines
}
