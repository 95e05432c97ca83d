pub mod cell;
pub mod colors;
pub mod events;
pub mod geometry;

pub use cell::{Cell, CellError, RawCell, validate_batch};
pub use colors::{Rgba, group_color, parse_css_color};
pub use events::*;
pub use geometry::{GridGeometry, WorldRect};
