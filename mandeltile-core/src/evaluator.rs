use rayon::prelude::*;

use crate::complex::Complex;
use crate::plane::SampleGrid;

/// Escape-time kernel contract.
///
/// `evaluate` fills `out` (row-major, `grid.len()` entries) with iteration
/// counts in `0..=max_iter`, where `max_iter` means the point never escaped.
/// It must be pure. A zero-size grid or `max_iter == 0` returns immediately
/// without touching `out`.
///
/// Implementations may parallelise internally, but one call must complete
/// before it returns: a tile's compute is atomic from the cache's viewpoint.
pub trait EscapeTimeEvaluator: Send + Sync {
    fn evaluate(&self, grid: &SampleGrid, max_iter: u32, out: &mut [u32]);

    /// Short backend name for logs.
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Returns `true` if `c` lies inside the main cardioid.
#[inline]
fn in_cardioid(re: f64, im: f64) -> bool {
    let im2 = im * im;
    let q = (re - 0.25) * (re - 0.25) + im2;
    q * (q + (re - 0.25)) <= 0.25 * im2
}

/// Returns `true` if `c` lies inside the period-2 bulb.
#[inline]
fn in_period2_bulb(re: f64, im: f64) -> bool {
    (re + 1.0) * (re + 1.0) + im * im <= 0.0625
}

/// Iteration count for one point, starting the orbit at `z₁ = c` and
/// counting steps while `|z|² < 4`. Returns `max_iter` for captured points.
#[inline]
pub fn escape_time(c: Complex, max_iter: u32) -> u32 {
    // Closed-form interior checks skip the two largest captured regions.
    if in_cardioid(c.re, c.im) || in_period2_bulb(c.re, c.im) {
        return max_iter;
    }

    let (mut x, mut y) = (c.re, c.im);
    let (mut x2, mut y2) = (x * x, y * y);
    let mut iter = 0;
    while x2 + y2 < 4.0 && iter < max_iter {
        let xt = x2 - y2 + c.re;
        y = 2.0 * x * y + c.im;
        x = xt;
        x2 = x * x;
        y2 = y * y;
        iter += 1;
    }
    iter
}

/// Double-precision Mandelbrot kernel, rows evaluated in parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mandelbrot;

impl EscapeTimeEvaluator for Mandelbrot {
    fn evaluate(&self, grid: &SampleGrid, max_iter: u32, out: &mut [u32]) {
        if grid.is_empty() || max_iter == 0 {
            return;
        }
        debug_assert_eq!(
            out.len(),
            grid.len(),
            "evaluator output buffer does not match the sample grid"
        );

        out.par_chunks_mut(grid.width as usize)
            .take(grid.height as usize)
            .enumerate()
            .for_each(|(py, row)| {
                for (px, count) in row.iter_mut().enumerate() {
                    *count = escape_time(grid.point(px as u32, py as u32), max_iter);
                }
            });
    }

    fn name(&self) -> &'static str {
        "f64"
    }
}
