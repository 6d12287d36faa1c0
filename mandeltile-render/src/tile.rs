//! The unit of cached fractal content.
//!
//! A [`Tile`] is shared between the display thread (reads its image) and the
//! render worker (the only writer). Pixel work happens outside the state
//! lock; the lock is held only to swap the finished image in.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::debug;

use mandeltile_core::{
    CoreError, EscapeTimeEvaluator, PlaneMapping, TileAddress, TileKey, TILE_SIZE,
};

use crate::allocator::TileAllocator;
use crate::palette::{ColorMap, Palette};
use crate::sync;

#[derive(Debug, Default)]
struct TileState {
    image: Option<Arc<RgbaImage>>,
    /// Set only by genuine computation, or copied from a completed mirror.
    completed: bool,
}

#[derive(Debug)]
pub struct Tile {
    address: TileAddress,
    key: TileKey,
    max_iterations: u32,
    state: RwLock<TileState>,
    /// Worker bookkeeping: the tile is on the residency list.
    pub(crate) resident: AtomicBool,
    /// Worker bookkeeping: the tile is on the pending-compute stack.
    pub(crate) queued: AtomicBool,
    /// Part of the controller's visible set.
    visible: AtomicBool,
    /// Live [`TilePin`]s.
    pins: AtomicUsize,
}

impl Tile {
    pub fn new(address: TileAddress, max_iterations: u32) -> crate::Result<Self> {
        if max_iterations == 0 {
            return Err(CoreError::InvalidMaxIterations(max_iterations).into());
        }
        Ok(Self {
            address,
            key: address.key(),
            max_iterations,
            state: RwLock::new(TileState::default()),
            resident: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            visible: AtomicBool::new(false),
            pins: AtomicUsize::new(0),
        })
    }

    /// A tile that already holds an image, e.g. one read back from a
    /// snapshot.
    pub fn with_image(
        address: TileAddress,
        max_iterations: u32,
        image: RgbaImage,
        completed: bool,
    ) -> crate::Result<Self> {
        let tile = Self::new(address, max_iterations)?;
        {
            let mut state = sync::write(&tile.state);
            state.image = Some(Arc::new(image));
            state.completed = completed;
        }
        Ok(tile)
    }

    pub fn address(&self) -> TileAddress {
        self.address
    }

    pub fn level(&self) -> u32 {
        self.address.level
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn mirror_key(&self) -> TileKey {
        self.key.mirror()
    }

    pub fn coarser_key(&self) -> TileKey {
        self.key.coarser()
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Current image, exact or approximate.
    pub fn image(&self) -> Option<Arc<RgbaImage>> {
        sync::read(&self.state).image.clone()
    }

    pub fn has_image(&self) -> bool {
        sync::read(&self.state).image.is_some()
    }

    pub fn is_completed(&self) -> bool {
        sync::read(&self.state).completed
    }

    /// Image together with its completion flag, read atomically.
    pub fn snapshot(&self) -> (Option<Arc<RgbaImage>>, bool) {
        let state = sync::read(&self.state);
        (state.image.clone(), state.completed)
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    pub(crate) fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Release);
    }

    /// Keep this tile's completed image out of eviction until the returned
    /// guard is dropped.
    pub fn pin(self: &Arc<Self>) -> TilePin {
        self.pins.fetch_add(1, Ordering::AcqRel);
        TilePin(Arc::clone(self))
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    /// Compute the exact image for this tile.
    ///
    /// The destination is allocated before any evaluation so that memory
    /// pressure fails fast. Returns `Ok(false)` if the tile was already
    /// completed. A failed call leaves the tile untouched and may be retried.
    pub fn compute(
        &self,
        evaluator: &dyn EscapeTimeEvaluator,
        mapping: &PlaneMapping,
        scratch: &mut ComputeScratch,
    ) -> crate::Result<bool> {
        if self.is_completed() {
            return Ok(false);
        }

        let mut image = scratch.allocator.allocate()?;
        let start = Instant::now();

        let grid = mapping.sample_grid(&self.address);
        debug_assert_eq!(grid.len(), (TILE_SIZE * TILE_SIZE) as usize);
        scratch.iterations.clear();
        scratch.iterations.resize(grid.len(), 0);
        evaluator.evaluate(&grid, self.max_iterations, &mut scratch.iterations);
        debug_assert_eq!(scratch.iterations.len() * 4, image.len());

        let map = color_map_for(&mut scratch.color_map, &scratch.palette, self.max_iterations);
        map.colorize(&scratch.iterations, &mut image);

        let installed = self.install(image, true, &mut scratch.allocator, |state| {
            !state.completed
        });
        if installed {
            debug!(
                tile = %self.address,
                max_iter = self.max_iterations,
                evaluator = evaluator.name(),
                elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                "tile computed"
            );
        }
        Ok(installed)
    }

    /// Seed this tile from its real-axis reflection.
    ///
    /// Applies when this tile has no image, or holds only an approximation
    /// and `source` is completed. The copy carries the source's completion
    /// flag.
    pub fn from_mirror(&self, source: &Tile, alloc: &mut TileAllocator) -> crate::Result<bool> {
        debug_assert_eq!(source.key, self.key.mirror());
        let (Some(src), src_completed) = source.snapshot() else {
            return Ok(false);
        };
        let accepts = move |state: &TileState| {
            state.image.is_none() || (!state.completed && src_completed)
        };
        if !accepts(&*sync::read(&self.state)) {
            return Ok(false);
        }

        let mut image = alloc.allocate()?;
        flip_rows(&src, &mut image);
        Ok(self.install(image, src_completed, alloc, accepts))
    }

    /// Seed this tile with the matching quadrant of the one-level-coarser
    /// tile, upscaled. Never marks the tile completed.
    pub fn zoom_from_coarser(
        &self,
        coarser: &Tile,
        alloc: &mut TileAllocator,
    ) -> crate::Result<bool> {
        debug_assert_eq!(coarser.key, self.key.coarser());
        if self.has_image() {
            return Ok(false);
        }
        let Some(src) = coarser.image() else {
            return Ok(false);
        };

        let mut image = alloc.allocate()?;
        let half = TILE_SIZE / 2;
        let (right, bottom) = self.address.quadrant();
        let quadrant = imageops::crop_imm(
            src.as_ref(),
            u32::from(right) * half,
            u32::from(bottom) * half,
            half,
            half,
        )
        .to_image();
        let scaled = imageops::resize(&quadrant, TILE_SIZE, TILE_SIZE, FilterType::Triangle);
        image.copy_from_slice(&scaled);

        Ok(self.install(image, false, alloc, |state| state.image.is_none()))
    }

    /// Discard the image and clear `completed`. Idempotent.
    pub fn reclaim(&self) -> Option<Arc<RgbaImage>> {
        let mut state = sync::write(&self.state);
        state.completed = false;
        state.image.take()
    }

    /// Swap `image` in if `accepts` still holds under the write lock. The
    /// replaced image, or the rejected one, goes back to the allocator.
    fn install(
        &self,
        image: RgbaImage,
        completed: bool,
        alloc: &mut TileAllocator,
        accepts: impl Fn(&TileState) -> bool,
    ) -> bool {
        let replaced = {
            let mut state = sync::write(&self.state);
            if !accepts(&*state) {
                drop(state);
                alloc.recycle(image);
                return false;
            }
            state.completed = completed;
            state.image.replace(Arc::new(image))
        };
        if let Some(old) = replaced {
            alloc.release(old);
        }
        true
    }
}

/// Holds a [`Tile`] pinned; see [`Tile::pin`].
#[derive(Debug)]
pub struct TilePin(Arc<Tile>);

impl TilePin {
    pub fn tile(&self) -> &Arc<Tile> {
        &self.0
    }
}

impl Drop for TilePin {
    fn drop(&mut self) {
        self.0.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Copy `src` into `dst` with rows in reverse order.
fn flip_rows(src: &RgbaImage, dst: &mut RgbaImage) {
    let row_len = src.width() as usize * 4;
    for (dst_row, src_row) in dst
        .chunks_exact_mut(row_len)
        .zip(src.chunks_exact(row_len).rev())
    {
        dst_row.copy_from_slice(src_row);
    }
}

// ---------------------------------------------------------------------------
// Worker-owned scratch state
// ---------------------------------------------------------------------------

/// Buffers reused across tile computations: the iteration-count scratch,
/// the per-budget color map, and the image allocator. One instance lives in
/// each render worker.
pub struct ComputeScratch {
    iterations: Vec<u32>,
    color_map: Option<ColorMap>,
    palette: Palette,
    pub allocator: TileAllocator,
}

impl ComputeScratch {
    pub fn new(palette: Palette, allocator: TileAllocator) -> Self {
        Self {
            iterations: Vec::with_capacity((TILE_SIZE * TILE_SIZE) as usize),
            color_map: None,
            palette,
            allocator,
        }
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    /// Color map for `max_iterations`, rebuilt only when the budget changes.
    pub fn color_map(&mut self, max_iterations: u32) -> &ColorMap {
        color_map_for(&mut self.color_map, &self.palette, max_iterations)
    }
}

fn color_map_for<'a>(
    slot: &'a mut Option<ColorMap>,
    palette: &Palette,
    max_iterations: u32,
) -> &'a ColorMap {
    if slot
        .as_ref()
        .is_some_and(|map| map.max_iterations() != max_iterations)
    {
        *slot = None;
    }
    slot.get_or_insert_with(|| ColorMap::new(palette, max_iterations))
}

impl Default for ComputeScratch {
    fn default() -> Self {
        Self::new(Palette::default(), TileAllocator::unbounded())
    }
}
