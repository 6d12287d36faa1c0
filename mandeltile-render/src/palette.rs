use rayon::prelude::*;

const LUT_SIZE: usize = 256;

/// Color of points judged captured (`n == max_iterations`).
pub const CAPTURED_COLOR: [u8; 4] = [0, 0, 0, 255];

// ---------------------------------------------------------------------------
// Palette
// ---------------------------------------------------------------------------

/// A color palette backed by a gradient lookup table.
///
/// The table is a ring of `LUT_SIZE` RGBA colors; lookups interpolate
/// linearly between adjacent entries.
#[derive(Clone)]
pub struct Palette {
    pub name: &'static str,
    ring: Vec<[u8; 4]>,
}

impl Palette {
    /// Palette over an explicit color ring. An empty ring falls back to a
    /// single opaque white entry.
    pub fn new(name: &'static str, mut ring: Vec<[u8; 4]>) -> Self {
        if ring.is_empty() {
            ring.push([255, 255, 255, 255]);
        }
        Self { name, ring }
    }

    /// Palette whose ring is interpolated from `(position, rgb)` stops with
    /// positions ascending in `[0, 1]`.
    pub fn from_stops(name: &'static str, stops: &[(f64, [u8; 3])]) -> Self {
        Self::new(name, ring_from_stops(stops))
    }

    /// Sample the gradient at `t ∈ [0, 1)`; values outside wrap.
    pub fn sample_unit(&self, t: f64) -> [u8; 4] {
        let pos = t.rem_euclid(1.0) * self.ring.len() as f64;
        let lo = (pos as usize).min(self.ring.len() - 1);
        let hi = (lo + 1) % self.ring.len();
        mix(self.ring[lo], self.ring[hi], pos.fract())
    }
}

impl Default for Palette {
    fn default() -> Self {
        classic()
    }
}

impl std::fmt::Debug for Palette {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Palette").field("name", &self.name).finish()
    }
}

fn mix(a: [u8; 4], b: [u8; 4], t: f64) -> [u8; 4] {
    let channel = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * t).round() as u8;
    [channel(a[0], b[0]), channel(a[1], b[1]), channel(a[2], b[2]), 255]
}

fn ring_from_stops(stops: &[(f64, [u8; 3])]) -> Vec<[u8; 4]> {
    let opaque = |[r, g, b]: [u8; 3]| [r, g, b, 255];
    match stops {
        [] => Vec::new(),
        [(_, only)] => vec![opaque(*only); LUT_SIZE],
        _ => {
            let mut ring = Vec::with_capacity(LUT_SIZE);
            let mut window = stops.windows(2).peekable();
            for k in 0..LUT_SIZE {
                let t = k as f64 / LUT_SIZE as f64;
                while let Some(w) = window.peek() {
                    if t > w[1].0 && window.len() > 1 {
                        window.next();
                    } else {
                        break;
                    }
                }
                let color = match window.peek() {
                    Some(w) => {
                        let ((t0, c0), (t1, c1)) = (w[0], w[1]);
                        if t1 > t0 {
                            mix(opaque(c0), opaque(c1), ((t - t0) / (t1 - t0)).clamp(0.0, 1.0))
                        } else {
                            opaque(c0)
                        }
                    }
                    None => opaque(stops[stops.len() - 1].1),
                };
                ring.push(color);
            }
            ring
        }
    }
}

// ---------------------------------------------------------------------------
// Per-budget color map
// ---------------------------------------------------------------------------

/// Iteration-count → color table for one iteration budget.
///
/// Holds `max_iterations + 1` entries: escape counts spread once across the
/// palette gradient, and the last entry is [`CAPTURED_COLOR`]. Rebuilt only
/// when the budget changes.
#[derive(Debug, Clone)]
pub struct ColorMap {
    max_iterations: u32,
    colors: Vec<[u8; 4]>,
}

impl ColorMap {
    pub fn new(palette: &Palette, max_iterations: u32) -> Self {
        let n = max_iterations as usize;
        let mut colors = Vec::with_capacity(n + 1);
        colors.extend((0..n).map(|k| palette.sample_unit(k as f64 / n as f64)));
        colors.push(CAPTURED_COLOR);
        Self {
            max_iterations,
            colors,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Color for an iteration count; counts above the budget are captured.
    #[inline]
    pub fn color(&self, n: u32) -> [u8; 4] {
        self.colors[n.min(self.max_iterations) as usize]
    }

    /// Write one RGBA pixel per count into `pixels`.
    pub fn colorize(&self, counts: &[u32], pixels: &mut [u8]) {
        debug_assert_eq!(pixels.len(), counts.len() * 4);
        pixels
            .par_chunks_mut(4)
            .zip(counts.par_iter())
            .for_each(|(pixel, &n)| pixel.copy_from_slice(&self.color(n)));
    }
}

// ---------------------------------------------------------------------------
// Builtin palettes
// ---------------------------------------------------------------------------

pub fn builtin_palettes() -> Vec<Palette> {
    vec![classic(), fire(), ocean(), grayscale()]
}

fn classic() -> Palette {
    Palette::from_stops(
        "Classic",
        &[
            (0.0, [9, 1, 47]),
            (0.2, [12, 44, 138]),
            (0.45, [134, 181, 229]),
            (0.6, [241, 233, 191]),
            (0.8, [204, 128, 0]),
            (1.0, [9, 1, 47]),
        ],
    )
}

fn fire() -> Palette {
    Palette::from_stops(
        "Fire",
        &[
            (0.0, [25, 0, 0]),
            (0.35, [180, 30, 0]),
            (0.65, [250, 150, 10]),
            (0.9, [255, 235, 120]),
            (1.0, [25, 0, 0]),
        ],
    )
}

fn ocean() -> Palette {
    Palette::from_stops(
        "Ocean",
        &[
            (0.0, [2, 16, 36]),
            (0.4, [8, 88, 140]),
            (0.7, [64, 190, 210]),
            (0.9, [210, 250, 250]),
            (1.0, [2, 16, 36]),
        ],
    )
}

fn grayscale() -> Palette {
    Palette::from_stops(
        "Grayscale",
        &[(0.0, [32, 32, 32]), (0.5, [240, 240, 240]), (1.0, [32, 32, 32])],
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rings_are_full() {
        for pal in builtin_palettes() {
            assert_eq!(pal.ring.len(), LUT_SIZE, "{}", pal.name);
        }
    }

    #[test]
    fn stops_are_hit_exactly() {
        let pal = Palette::from_stops("t", &[(0.0, [0, 0, 0]), (0.5, [200, 100, 50]), (1.0, [0, 0, 0])]);
        assert_eq!(pal.ring[0], [0, 0, 0, 255]);
        assert_eq!(pal.ring[LUT_SIZE / 2], [200, 100, 50, 255]);
        assert_eq!(pal.ring[LUT_SIZE / 4], [100, 50, 25, 255]);
    }

    #[test]
    fn empty_ring_is_usable() {
        let pal = Palette::new("empty", Vec::new());
        assert_eq!(pal.sample_unit(0.3), [255, 255, 255, 255]);
    }

    #[test]
    fn captured_is_black() {
        let map = ColorMap::new(&Palette::default(), 20);
        assert_eq!(map.color(20), CAPTURED_COLOR);
        assert_eq!(map.color(500), CAPTURED_COLOR);
    }

    #[test]
    fn escaped_is_not_captured_color() {
        for pal in builtin_palettes() {
            let map = ColorMap::new(&pal, 64);
            for n in [0, 1, 31, 63] {
                let c = map.color(n);
                assert_ne!(c, CAPTURED_COLOR, "{} n={n}", pal.name);
                assert_eq!(c[3], 255);
            }
        }
    }

    #[test]
    fn map_has_one_entry_per_count() {
        let map = ColorMap::new(&Palette::default(), 15);
        assert_eq!(map.colors.len(), 16);
        assert_eq!(map.max_iterations(), 15);
    }

    #[test]
    fn zero_budget_map_is_all_captured() {
        let map = ColorMap::new(&Palette::default(), 0);
        assert_eq!(map.color(0), CAPTURED_COLOR);
    }

    #[test]
    fn colorize_writes_every_pixel() {
        let map = ColorMap::new(&Palette::default(), 10);
        let counts = [0, 5, 10, 10];
        let mut pixels = [7u8; 16];
        map.colorize(&counts, &mut pixels);
        assert_eq!(&pixels[0..4], &map.color(0));
        assert_eq!(&pixels[4..8], &map.color(5));
        assert_eq!(&pixels[8..12], &CAPTURED_COLOR);
        assert_eq!(&pixels[12..16], &CAPTURED_COLOR);
    }

    #[test]
    fn gradient_wraps() {
        let p = Palette::default();
        assert_eq!(p.sample_unit(0.0), p.sample_unit(1.0));
    }
}
