/// Straight-alpha RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba::new(0, 0, 0, 0);
    pub const WHITE: Rgba = Rgba::new(255, 255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }

    /// Build from an `rgba()`-style alpha in `0.0..=1.0`.
    pub fn with_alpha_f(r: u8, g: u8, b: u8, alpha: f64) -> Self {
        Self::new(r, g, b, (alpha.clamp(0.0, 1.0) * 255.0).round() as u8)
    }

    /// Composite `self` over `dst` (source-over).
    pub fn over(self, dst: Rgba) -> Rgba {
        match self.a {
            0 => dst,
            255 => self,
            _ => {
                let sa = self.a as u32;
                let da = dst.a as u32;
                let inv = 255 - sa;
                // out_a scaled by 255
                let out_a = sa * 255 + da * inv;
                if out_a == 0 {
                    return Rgba::TRANSPARENT;
                }
                let mix = |s: u8, d: u8| -> u8 {
                    let num = s as u32 * sa * 255 + d as u32 * da * inv;
                    ((num + out_a / 2) / out_a) as u8
                };
                Rgba::new(
                    mix(self.r, dst.r),
                    mix(self.g, dst.g),
                    mix(self.b, dst.b),
                    ((out_a + 127) / 255) as u8,
                )
            }
        }
    }

    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes([self.r, self.g, self.b, self.a])
    }

    pub fn from_u32(v: u32) -> Self {
        let [r, g, b, a] = v.to_be_bytes();
        Self { r, g, b, a }
    }
}

/// Deterministic group color via CRC32 hash of the group id.
/// Returns an opaque color from the first 3 bytes of the hash.
pub fn group_color(name: &str) -> Rgba {
    let hash = crc32fast::hash(name.as_bytes());
    let bytes = hash.to_be_bytes();
    Rgba::opaque(bytes[0], bytes[1], bytes[2])
}

/// Parse the CSS color forms cells are tagged with: `#rgb`, `#rrggbb`,
/// `#rrggbbaa`, `rgb(r, g, b)` and `rgba(r, g, b, a)`.
pub fn parse_css_color(input: &str) -> Option<Rgba> {
    let s = input.trim();
    if let Some(hex) = s.strip_prefix('#') {
        return parse_hex(hex);
    }

    let lower = s.to_ascii_lowercase();
    let (body, has_alpha) = if let Some(rest) = lower.strip_prefix("rgba(") {
        (rest.strip_suffix(')')?, true)
    } else if let Some(rest) = lower.strip_prefix("rgb(") {
        (rest.strip_suffix(')')?, false)
    } else {
        return None;
    };

    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    let expected = if has_alpha { 4 } else { 3 };
    if parts.len() != expected {
        return None;
    }
    let channel = |p: &str| p.parse::<f64>().ok().map(|v| v.clamp(0.0, 255.0).round() as u8);
    let r = channel(parts[0])?;
    let g = channel(parts[1])?;
    let b = channel(parts[2])?;
    if has_alpha {
        let alpha = parts[3].parse::<f64>().ok()?;
        Some(Rgba::with_alpha_f(r, g, b, alpha))
    } else {
        Some(Rgba::opaque(r, g, b))
    }
}

fn parse_hex(hex: &str) -> Option<Rgba> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    let nibble = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok().map(|v| v * 17);
    match hex.len() {
        3 => Some(Rgba::opaque(nibble(0)?, nibble(1)?, nibble(2)?)),
        6 => Some(Rgba::opaque(byte(0)?, byte(2)?, byte(4)?)),
        8 => Some(Rgba::new(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
        _ => None,
    }
}
