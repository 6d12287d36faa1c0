use crate::address::TileAddress;
use crate::complex::Complex;
use crate::error::CoreError;

/// Side length of every tile in pixels. 128×128 RGBA = 64 KB per tile image.
pub const TILE_SIZE: u32 = 128;

/// Plane width covered by one level-0 tile in the default mapping.
///
/// A power of two keeps every sample coordinate exactly representable, so
/// mirrored rows sample exactly negated imaginary values.
pub const DEFAULT_BASE_WIDTH: f64 = 2.0;

/// A rectangular grid of sample points handed to an evaluator.
///
/// Sample `(px, py)` is at `(x0 + px·x_step, y0 + py·y_step)`; results are
/// stored row-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleGrid {
    pub x0: f64,
    pub x_step: f64,
    pub y0: f64,
    pub y_step: f64,
    pub width: u32,
    pub height: u32,
}

impl SampleGrid {
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn point(&self, px: u32, py: u32) -> Complex {
        Complex::new(
            self.x0 + px as f64 * self.x_step,
            self.y0 + py as f64 * self.y_step,
        )
    }
}

/// Affine mapping between the level-local virtual pixel space and the
/// complex plane.
///
/// `origin` is the top-left corner of tile `(0, 0)` at every level. Virtual
/// pixel x grows with the real part; virtual pixel y grows downward, toward
/// negative imaginary values. Each level halves the plane width of a tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneMapping {
    origin: Complex,
    base_width: f64,
}

impl PlaneMapping {
    pub fn new(origin: Complex, base_width: f64) -> crate::Result<Self> {
        if base_width <= 0.0 || !base_width.is_finite() {
            return Err(CoreError::InvalidPlaneMapping {
                reason: format!("base width must be positive and finite, got {base_width}"),
            });
        }
        if !origin.re.is_finite() || !origin.im.is_finite() {
            return Err(CoreError::InvalidPlaneMapping {
                reason: format!("origin must be finite, got {origin}"),
            });
        }
        Ok(Self { origin, base_width })
    }

    /// Mapping whose level-0 tile `(0, 0)` is centred on `center` and spans
    /// `base_width` in both directions.
    pub fn centered_on(center: Complex, base_width: f64) -> crate::Result<Self> {
        let half = base_width / 2.0;
        Self::new(Complex::new(center.re - half, center.im + half), base_width)
    }

    pub fn origin(&self) -> Complex {
        self.origin
    }

    /// Plane width covered by one tile at `level`.
    #[inline]
    pub fn tile_width(&self, level: u32) -> f64 {
        self.base_width / (1u64 << level) as f64
    }

    /// Plane distance between adjacent pixels at `level`.
    #[inline]
    pub fn pixel_step(&self, level: u32) -> f64 {
        self.tile_width(level) / TILE_SIZE as f64
    }

    /// Sample grid for one tile, sampling pixel centres.
    pub fn sample_grid(&self, addr: &TileAddress) -> SampleGrid {
        let step = self.pixel_step(addr.level);
        let size = TILE_SIZE as f64;
        SampleGrid {
            x0: self.origin.re + (addr.i as f64 * size + 0.5) * step,
            x_step: step,
            y0: self.origin.im - (addr.j as f64 * size + 0.5) * step,
            y_step: -step,
            width: TILE_SIZE,
            height: TILE_SIZE,
        }
    }

    /// Plane point at virtual pixel coordinates (fractional allowed).
    pub fn virtual_to_complex(&self, level: u32, vx: f64, vy: f64) -> Complex {
        let step = self.pixel_step(level);
        Complex::new(self.origin.re + vx * step, self.origin.im - vy * step)
    }

    /// Virtual pixel coordinates of a plane point.
    pub fn complex_to_virtual(&self, level: u32, c: Complex) -> (f64, f64) {
        let step = self.pixel_step(level);
        ((c.re - self.origin.re) / step, (self.origin.im - c.im) / step)
    }

    /// True when tile row boundaries are symmetric about the real axis, so
    /// row `j` is the exact reflection of row `-j - 1`.
    pub fn is_mirror_symmetric(&self) -> bool {
        self.origin.im == 0.0
    }
}

impl Default for PlaneMapping {
    fn default() -> Self {
        Self {
            origin: Complex::ZERO,
            base_width: DEFAULT_BASE_WIDTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-12;

    #[test]
    fn tile_width_halves_per_level() {
        let m = PlaneMapping::default();
        assert!((m.tile_width(0) - 2.0).abs() < EPSILON);
        assert!((m.tile_width(1) - 1.0).abs() < EPSILON);
        assert!((m.tile_width(4) - 0.125).abs() < EPSILON);
    }

    #[test]
    fn default_puts_tile_zero_at_the_origin() {
        let m = PlaneMapping::default();
        assert_eq!(m.origin(), Complex::ZERO);
        assert_eq!(m.virtual_to_complex(0, 0.0, 0.0), Complex::ZERO);
        assert!(m.is_mirror_symmetric());
    }

    #[test]
    fn grid_samples_pixel_centres() {
        let m = PlaneMapping::default();
        let grid = m.sample_grid(&TileAddress::new(0, 0, 0).unwrap());
        let step = 2.0 / TILE_SIZE as f64;
        assert!((grid.x0 - step / 2.0).abs() < EPSILON);
        assert!((grid.y0 + step / 2.0).abs() < EPSILON);
        assert!(grid.y_step < 0.0);
        assert_eq!(grid.len(), (TILE_SIZE * TILE_SIZE) as usize);
    }

    #[test]
    fn mirrored_rows_sample_negated_imaginary_parts() {
        let m = PlaneMapping::default();
        let addr = TileAddress::new(3, -2, 1).unwrap();
        let grid = m.sample_grid(&addr);
        let mirror = m.sample_grid(&addr.mirror());
        for py in [0, 1, 63, TILE_SIZE - 1] {
            let a = grid.point(5, py);
            let b = mirror.point(5, TILE_SIZE - 1 - py);
            assert_eq!(a, b.conj());
        }
    }

    #[test]
    fn centered_mapping_puts_center_mid_tile() {
        let m = PlaneMapping::centered_on(Complex::new(-0.5, 0.0), 3.0).unwrap();
        let mid = m.virtual_to_complex(0, TILE_SIZE as f64 / 2.0, TILE_SIZE as f64 / 2.0);
        assert!((mid.re + 0.5).abs() < EPSILON);
        assert!(mid.im.abs() < EPSILON);
        assert!(!m.is_mirror_symmetric());
    }

    #[test]
    fn virtual_round_trip() {
        let m = PlaneMapping::default();
        let c = Complex::new(-0.743, 0.131);
        let (vx, vy) = m.complex_to_virtual(6, c);
        let back = m.virtual_to_complex(6, vx, vy);
        assert!((back.re - c.re).abs() < EPSILON);
        assert!((back.im - c.im).abs() < EPSILON);
    }

    #[test]
    fn invalid_mappings() {
        assert!(PlaneMapping::new(Complex::ZERO, 0.0).is_err());
        assert!(PlaneMapping::new(Complex::ZERO, f64::NAN).is_err());
        assert!(PlaneMapping::new(Complex::new(f64::INFINITY, 0.0), 1.0).is_err());
    }
}
