use gridclaim_shared::WorldRect;

use crate::cluster::Cluster;

/// Fraction of the cluster's shorter side used as the starting font size.
const FONT_TO_SIDE_RATIO: f64 = 0.8;
/// Labels may span at most this fraction of the cluster width.
const MAX_WIDTH_RATIO: f64 = 0.9;
/// Labels at or below this on-screen size are not drawn.
const MIN_SCREEN_FONT_PX: f64 = 1.0;

/// Where and how large a cluster label is drawn, in world units.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelPlacement {
    pub text: String,
    pub world_x: f64,
    pub world_y: f64,
    pub world_font_size: f64,
}

/// Approximate advance of `text` in a bold sans-serif face, in units of the
/// font size. Wide (CJK, Hangul, fullwidth) glyphs take a full em.
pub fn estimate_text_width(text: &str, font_size: f64) -> f64 {
    let ems: f64 = text
        .chars()
        .map(|c| {
            if is_wide(c) {
                1.0
            } else if c.is_ascii_uppercase() || c.is_ascii_digit() {
                0.68
            } else if c == ' ' {
                0.28
            } else {
                0.58
            }
        })
        .sum();
    ems * font_size
}

fn is_wide(c: char) -> bool {
    matches!(c as u32,
        0x1100..=0x115F
        | 0x2E80..=0xA4CF
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6)
}

/// Size a cluster's label to its bounding box, or `None` when it is culled or
/// would be too small to read at `scale`.
pub fn place_label(cluster: &Cluster, visible: &WorldRect, scale: f64) -> Option<LabelPlacement> {
    if !visible.intersects(&cluster.bounds) {
        return None;
    }

    let mut world_font_size = cluster.width().min(cluster.height()) * FONT_TO_SIDE_RATIO;
    let measured = estimate_text_width(&cluster.group_id, world_font_size);
    let max_width = cluster.width() * MAX_WIDTH_RATIO;
    if measured > max_width && measured > 0.0 {
        world_font_size *= max_width / measured;
    }

    if world_font_size * scale <= MIN_SCREEN_FONT_PX {
        return None;
    }

    let (world_x, world_y) = cluster.centroid();
    Some(LabelPlacement {
        text: cluster.group_id.clone(),
        world_x,
        world_y,
        world_font_size,
    })
}
