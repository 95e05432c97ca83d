use std::collections::HashMap;

use gridclaim_shared::{Cell, GridGeometry, Rgba, group_color, parse_css_color};

use crate::chunks::ChunkKey;
use crate::error::RasterError;

/// Resolves the fill color of a cell: group override, the cell's own CSS
/// color, the hashed group color, then white.
#[derive(Debug, Clone, Default)]
pub struct Palette {
    group_overrides: HashMap<String, Rgba>,
}

impl Palette {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>, color: Rgba) -> Self {
        self.group_overrides.insert(group.into(), color);
        self
    }

    pub fn resolve(&self, cell: &Cell) -> Rgba {
        if let Some(group) = &cell.group_id
            && let Some(color) = self.group_overrides.get(group)
        {
            return *color;
        }
        if let Some(color) = parse_css_color(&cell.color) {
            return color;
        }
        match &cell.group_id {
            Some(group) => group_color(group),
            None => Rgba::WHITE,
        }
    }
}

/// Cached bitmap of one chunk. Covers the chunk's full world extent with one
/// texel per grid cell; texel `(0, 0)` is the chunk's top-left cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRaster {
    side: usize,
    texels: Vec<u32>,
    painted: usize,
}

impl ChunkRaster {
    /// Render every member lying inside `key`'s extent into a fresh bitmap.
    pub fn render<'a>(
        key: ChunkKey,
        geometry: &GridGeometry,
        members: impl IntoIterator<Item = &'a Cell>,
        palette: &Palette,
    ) -> Result<Self, RasterError> {
        let side = geometry.cells_per_chunk_axis();
        let len = side * side;
        let mut texels = Vec::new();
        texels
            .try_reserve_exact(len)
            .map_err(|_| RasterError::Allocation { key, texels: len })?;
        texels.resize(len, Rgba::TRANSPARENT.to_u32());

        let origin_x = key.cx * geometry.chunk_size;
        let origin_y = key.cy * geometry.chunk_size;
        let mut painted = 0usize;
        for cell in members {
            let local_x = cell.x - origin_x;
            let local_y = cell.y - origin_y;
            if local_x < 0
                || local_y < 0
                || local_x >= geometry.chunk_size
                || local_y >= geometry.chunk_size
            {
                continue;
            }
            let tx = (local_x / geometry.grid_step) as usize;
            let ty = (local_y / geometry.grid_step) as usize;
            texels[ty * side + tx] = palette.resolve(cell).to_u32();
            painted += 1;
        }

        Ok(Self {
            side,
            texels,
            painted,
        })
    }

    /// Texels per side.
    pub fn side(&self) -> usize {
        self.side
    }

    /// Number of cells painted by the last render.
    pub fn painted(&self) -> usize {
        self.painted
    }

    pub fn texel(&self, tx: usize, ty: usize) -> Rgba {
        if tx >= self.side || ty >= self.side {
            return Rgba::TRANSPARENT;
        }
        Rgba::from_u32(self.texels[ty * self.side + tx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> GridGeometry {
        GridGeometry::new(4000, 20, 1000).expect("valid geometry")
    }

    #[test]
    fn paints_members_at_local_texels() {
        let g = geometry();
        let a = Cell::new(&g, 1020, 1040, "#ff0000").expect("cell");
        let b = Cell::new(&g, 1980, 1980, "#00ff00").expect("cell");
        let raster =
            ChunkRaster::render(ChunkKey::new(1, 1), &g, [&a, &b], &Palette::new()).expect("render");

        assert_eq!(raster.side(), 50);
        assert_eq!(raster.painted(), 2);
        assert_eq!(raster.texel(1, 2), Rgba::opaque(255, 0, 0));
        assert_eq!(raster.texel(49, 49), Rgba::opaque(0, 255, 0));
        assert_eq!(raster.texel(0, 0), Rgba::TRANSPARENT);
    }

    #[test]
    fn skips_members_outside_the_chunk() {
        let g = geometry();
        let outside = Cell::new(&g, 0, 0, "#ff0000").expect("cell");
        let raster = ChunkRaster::render(ChunkKey::new(1, 1), &g, [&outside], &Palette::new())
            .expect("render");
        assert_eq!(raster.painted(), 0);
    }

    #[test]
    fn palette_prefers_group_override_then_cell_color() {
        let g = geometry();
        let palette = Palette::new().with_group("X", Rgba::opaque(1, 2, 3));
        let grouped = Cell::new(&g, 0, 0, "#ff0000").expect("cell").with_group("X");
        let plain = Cell::new(&g, 0, 0, "#ff0000").expect("cell").with_group("Y");
        let bad_color = Cell::new(&g, 0, 0, "not-a-color").expect("cell").with_group("Y");
        let bare = Cell::new(&g, 0, 0, "not-a-color").expect("cell");

        assert_eq!(palette.resolve(&grouped), Rgba::opaque(1, 2, 3));
        assert_eq!(palette.resolve(&plain), Rgba::opaque(255, 0, 0));
        assert_eq!(palette.resolve(&bad_color), group_color("Y"));
        assert_eq!(palette.resolve(&bare), Rgba::WHITE);
    }
}
