//! Bounded tile-image memory.
//!
//! Tile images are the only large allocations in the pipeline. The worker
//! owns one `TileAllocator` and routes every image it creates or discards
//! through it, so "memory is short" is an explicit, recoverable
//! [`RenderError::AllocationFailed`] instead of a process abort.

use std::sync::Arc;

use image::RgbaImage;
use tracing::trace;

use mandeltile_core::TILE_SIZE;

use crate::error::RenderError;

/// Freed buffers kept for reuse.
const POOL_LIMIT: usize = 32;

const TILE_BYTES: usize = (TILE_SIZE * TILE_SIZE * 4) as usize;

#[derive(Debug)]
pub struct TileAllocator {
    capacity: usize,
    live: usize,
    pool: Vec<Vec<u8>>,
}

impl TileAllocator {
    /// Allocator that refuses to hold more than `capacity` live images.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            live: 0,
            pool: Vec::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Images handed out and not yet released.
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Hand out a `TILE_SIZE`² RGBA image. Contents are unspecified; callers
    /// overwrite every pixel.
    pub fn allocate(&mut self) -> crate::Result<RgbaImage> {
        let failed = RenderError::AllocationFailed {
            live: self.live,
            capacity: self.capacity,
        };
        if self.live >= self.capacity {
            return Err(failed);
        }

        let buf = match self.pool.pop() {
            Some(buf) => buf,
            None => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(TILE_BYTES).map_err(|_| failed)?;
                buf.resize(TILE_BYTES, 0);
                buf
            }
        };
        let image = RgbaImage::from_raw(TILE_SIZE, TILE_SIZE, buf).ok_or(
            RenderError::InvalidDimensions {
                width: TILE_SIZE,
                height: TILE_SIZE,
            },
        )?;
        self.live += 1;
        Ok(image)
    }

    /// Return an image that was installed in a tile. The buffer is pooled
    /// when no reader still holds the `Arc`.
    pub fn release(&mut self, image: Arc<RgbaImage>) {
        self.live = self.live.saturating_sub(1);
        match Arc::try_unwrap(image) {
            Ok(image) => self.stash(image),
            Err(_) => trace!("released tile image still shared by a reader"),
        }
    }

    /// Return an image that was allocated but never installed.
    pub fn recycle(&mut self, image: RgbaImage) {
        self.live = self.live.saturating_sub(1);
        self.stash(image);
    }

    /// Account for images created outside the allocator (restored tiles).
    pub fn adopt(&mut self, count: usize) {
        self.live = self.live.saturating_add(count);
    }

    /// Overwrite the live count, used to resynchronise after a job panicked
    /// while holding an allocation.
    pub fn reset_live(&mut self, live: usize) {
        self.live = live;
    }

    fn stash(&mut self, image: RgbaImage) {
        if self.pool.len() < POOL_LIMIT {
            self.pool.push(image.into_raw());
        }
    }
}
