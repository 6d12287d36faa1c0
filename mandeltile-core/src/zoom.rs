//! Zoom-level arithmetic shared by the controller and the tiles.
//!
//! Each level halves the plane width covered by one tile. The integer
//! "zoom factor" is 0 at level 0 and `2^(level-1)` above it; the iteration
//! budget grows with its logarithm so deep levels get more iterations
//! without exploding.

use crate::error::CoreError;

/// Deepest supported level. Tile coordinates at this level still fit the
/// 15-bit magnitude of [`TileKey`](crate::TileKey) for the whole set.
pub const MAX_ZOOM_LEVEL: u32 = 14;

/// Integer zoom factor for `level`.
#[inline]
pub fn zoom_factor(level: u32) -> u32 {
    if level == 0 {
        0
    } else {
        1 << (level - 1)
    }
}

/// Iteration budget shared by every tile requested at `level`:
/// `15 + ⌊10·ln(1 + zoomFactor)⌋`.
pub fn iteration_budget(level: u32) -> u32 {
    15 + (10.0 * (zoom_factor(level) as f64).ln_1p()) as u32
}

/// Validate a zoom level against [`MAX_ZOOM_LEVEL`].
pub fn check_level(level: u32) -> crate::Result<u32> {
    if level > MAX_ZOOM_LEVEL {
        return Err(CoreError::InvalidZoomLevel {
            level,
            max: MAX_ZOOM_LEVEL,
        });
    }
    Ok(level)
}

/// Rescale a pixel pan offset from one level to another so the same plane
/// point stays under the viewport center.
///
/// Zooming in multiplies exactly. Zooming out floors (`>>` on a signed
/// value), so in-then-out is lossless while out-then-in is exact only for
/// even offsets and otherwise lands one pixel lower.
pub fn rescale_pan(pan: i64, from: u32, to: u32) -> i64 {
    if to >= from {
        pan << (to - from)
    } else {
        pan >> (from - to)
    }
}
