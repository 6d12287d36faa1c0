//! Batch image assembly for export and capture.
//!
//! The assembler reads the covering tile set under the zoom lock once, then
//! polls without any controller lock until every tile is completed,
//! compositing each into the output as it lands. Panning or zooming meanwhile
//! is never blocked; tiles dropped from the queue by a level change, or given
//! up by the worker under memory pressure, are pushed again on the next poll.
//!
//! Each tile stays pinned from request until it is composited, so the worker
//! can evict what is already copied out but never a finished tile still
//! waiting for its poll.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{imageops, RgbaImage};
use tracing::{debug, info};

use mandeltile_core::Complex;

use crate::error::RenderError;
use crate::sync;
use crate::tile::TilePin;
use crate::viewport::{ControllerShared, TileRange};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancellation flag and progress counters for one assembly.
///
/// The progress counters let a caller display a progress bar from another
/// thread.
#[derive(Debug, Default)]
pub struct AssemblyCancel {
    cancelled: AtomicBool,
    progress_done: AtomicUsize,
    progress_total: AtomicUsize,
}

impl AssemblyCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn reset_progress(&self, total: usize) {
        self.progress_total.store(total, Ordering::Relaxed);
        self.progress_done.store(0, Ordering::Relaxed);
    }

    fn inc_progress(&self) {
        self.progress_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current progress as `(done, total)`.
    pub fn progress(&self) -> (usize, usize) {
        (
            self.progress_done.load(Ordering::Relaxed),
            self.progress_total.load(Ordering::Relaxed),
        )
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

pub struct Assembled {
    pub image: RgbaImage,
    pub level: u32,
    pub max_iterations: u32,
    /// Plane point at the center of the assembled image.
    pub center: Complex,
    pub tiles: usize,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

struct Placement {
    pin: TilePin,
    x: i64,
    y: i64,
}

pub struct ImageAssembler {
    shared: Arc<ControllerShared>,
    poll_interval: Duration,
}

impl ImageAssembler {
    pub(crate) fn new(shared: Arc<ControllerShared>, poll_interval: Duration) -> Self {
        Self {
            shared,
            poll_interval,
        }
    }

    /// Assemble the screen-space rectangle `(x, y, width, height)` of the
    /// current view. The rectangle may extend past the viewport edges.
    pub fn assemble(
        &self,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
        cancel: &AssemblyCancel,
    ) -> crate::Result<Assembled> {
        let start = Instant::now();

        let (level, max_iterations, vx, vy, range) = {
            let view = sync::lock(&self.shared.view);
            let (ox, oy) = view.screen_origin();
            let (vx, vy) = (ox + x, oy + y);
            (
                view.level,
                view.max_iterations,
                vx,
                vy,
                TileRange::covering(vx, vy, width, height),
            )
        };
        let range = range.ok_or(RenderError::InvalidDimensions { width, height })?;

        let size = mandeltile_core::TILE_SIZE as i64;
        let mut pending: Vec<Placement> = range
            .addresses(level)
            .into_iter()
            .filter_map(|addr| {
                let tile = self.shared.request(addr, max_iterations)?;
                Some(Placement {
                    pin: tile.pin(),
                    x: addr.i as i64 * size - vx,
                    y: addr.j as i64 * size - vy,
                })
            })
            .collect();
        let total = pending.len();
        cancel.reset_progress(total);
        debug!(level, tiles = total, width, height, "assembling image");

        let mut image = RgbaImage::new(width, height);
        loop {
            if cancel.is_cancelled() {
                info!(level, done = cancel.progress().0, total, "assembly cancelled");
                return Err(RenderError::Cancelled);
            }

            pending.retain(|p| {
                let tile = p.pin.tile();
                let (tile_image, completed) = tile.snapshot();
                match tile_image {
                    Some(tile_image) if completed => {
                        imageops::replace(&mut image, tile_image.as_ref(), p.x, p.y);
                        cancel.inc_progress();
                        false
                    }
                    _ => {
                        if !tile.is_queued() {
                            self.shared.queue.push_compute(Arc::clone(tile));
                        }
                        true
                    }
                }
            });
            if pending.is_empty() {
                break;
            }
            std::thread::sleep(self.poll_interval);
        }

        let mapping = &self.shared.mapping;
        let center = mapping.virtual_to_complex(
            level,
            vx as f64 + width as f64 / 2.0,
            vy as f64 + height as f64 / 2.0,
        );
        let elapsed = start.elapsed();
        info!(
            level,
            tiles = total,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "image assembled"
        );
        Ok(Assembled {
            image,
            level,
            max_iterations,
            center,
            tiles: total,
            elapsed,
        })
    }

    /// Assemble a `width`×`height` image centred on the viewport center.
    pub fn assemble_centered(
        &self,
        width: u32,
        height: u32,
        cancel: &AssemblyCancel,
    ) -> crate::Result<Assembled> {
        let (view_w, view_h) = {
            let view = sync::lock(&self.shared.view);
            (view.width as i64, view.height as i64)
        };
        let x = view_w / 2 - width as i64 / 2;
        let y = view_h / 2 - height as i64 / 2;
        self.assemble(x, y, width, height, cancel)
    }

    /// Assemble exactly the live viewport.
    pub fn capture(&self, cancel: &AssemblyCancel) -> crate::Result<Assembled> {
        let (width, height) = {
            let view = sync::lock(&self.shared.view);
            (view.width, view.height)
        };
        self.assemble(0, 0, width, height, cancel)
    }
}
