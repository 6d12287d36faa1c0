//! Tile addressing.
//!
//! A tile is identified by its zoom level and signed grid coordinates
//! `(i, j)`. Within a level, tiles are keyed by a packed 32-bit
//! [`TileKey`]: 15 magnitude bits plus a sign bit per axis, with negative
//! values stored as `-n - 1`. That encoding makes the real-axis mirror and
//! the one-level-coarser parent pure bit operations on the key.

use std::fmt;

use crate::error::CoreError;
use crate::zoom::check_level;

const SIGN_I: u32 = 0x0000_8000;
const SIGN_J: u32 = 0x8000_0000;
const MAGNITUDE: u32 = 0x7FFF;

/// Smallest coordinate representable in a [`TileKey`].
pub const COORD_MIN: i32 = -(MAGNITUDE as i32) - 1;
/// Largest coordinate representable in a [`TileKey`].
pub const COORD_MAX: i32 = MAGNITUDE as i32;

/// Packed per-level tile key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey(u32);

impl TileKey {
    /// Pack grid coordinates, rejecting values outside `COORD_MIN..=COORD_MAX`.
    pub fn pack(i: i32, j: i32) -> crate::Result<Self> {
        check_coord('i', i)?;
        check_coord('j', j)?;
        Ok(Self::pack_unchecked(i, j))
    }

    fn pack_unchecked(i: i32, j: i32) -> Self {
        let (neg_i, mag_i) = encode(i);
        let (neg_j, mag_j) = encode(j);
        let mut raw = mag_i | (mag_j << 16);
        if neg_i {
            raw |= SIGN_I;
        }
        if neg_j {
            raw |= SIGN_J;
        }
        Self(raw)
    }

    /// Rebuild a key from its raw bits (e.g. from a persisted record).
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn i(self) -> i32 {
        decode(self.0 & MAGNITUDE, self.0 & SIGN_I != 0)
    }

    pub fn j(self) -> i32 {
        decode((self.0 >> 16) & MAGNITUDE, self.0 & SIGN_J != 0)
    }

    /// Key of the tile reflected about the real axis: row `j` ↔ `-j - 1`.
    #[inline]
    pub fn mirror(self) -> Self {
        Self(self.0 ^ SIGN_J)
    }

    /// Key of the covering tile one level out: `(i >> 1, j >> 1)`, i.e.
    /// floor division, with both sign bits preserved.
    #[inline]
    pub fn coarser(self) -> Self {
        Self((self.0 & (SIGN_I | SIGN_J)) | ((self.0 & 0x7FFE_7FFE) >> 1))
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[inline]
fn encode(v: i32) -> (bool, u32) {
    if v < 0 {
        (true, (-(v as i64) - 1) as u32)
    } else {
        (false, v as u32)
    }
}

#[inline]
fn decode(magnitude: u32, negative: bool) -> i32 {
    if negative {
        -(magnitude as i32) - 1
    } else {
        magnitude as i32
    }
}

fn check_coord(axis: char, value: i32) -> crate::Result<()> {
    if !(COORD_MIN..=COORD_MAX).contains(&value) {
        return Err(CoreError::CoordinateOutOfRange { axis, value });
    }
    Ok(())
}

/// Full address of a tile: zoom level plus grid coordinates.
///
/// Column `i` grows to the right, row `j` grows downward (toward negative
/// imaginary values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileAddress {
    pub level: u32,
    pub i: i32,
    pub j: i32,
}

impl TileAddress {
    pub fn new(level: u32, i: i32, j: i32) -> crate::Result<Self> {
        check_level(level)?;
        check_coord('i', i)?;
        check_coord('j', j)?;
        Ok(Self { level, i, j })
    }

    pub fn from_key(level: u32, key: TileKey) -> crate::Result<Self> {
        Self::new(level, key.i(), key.j())
    }

    pub fn key(&self) -> TileKey {
        TileKey::pack_unchecked(self.i, self.j)
    }

    /// Address reflected about the real axis.
    pub fn mirror(&self) -> Self {
        Self {
            level: self.level,
            i: self.i,
            j: -self.j - 1,
        }
    }

    /// Covering tile one level out, or `None` at level 0.
    pub fn coarser(&self) -> Option<Self> {
        let level = self.level.checked_sub(1)?;
        Some(Self {
            level,
            i: self.i >> 1,
            j: self.j >> 1,
        })
    }

    /// Which quadrant of the coarser tile this tile covers:
    /// `(right half, bottom half)`.
    pub fn quadrant(&self) -> (bool, bool) {
        (self.i & 1 != 0, self.j & 1 != 0)
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}({},{})", self.level, self.i, self.j)
    }
}
