//! The viewport controller: pan/zoom state, the visible tile set, and the
//! completion callback that turns worker results into damage events.
//!
//! The view state mutex doubles as the zoom lock. Every zoom transition and
//! every completion callback runs under it, so a result computed for a level
//! the user has just left is never applied. Lock order is view state →
//! caches → job queue.

use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, trace, warn};

use mandeltile_core::zoom::{check_level, rescale_pan};
use mandeltile_core::{
    iteration_budget, Complex, EscapeTimeEvaluator, Mandelbrot, PlaneMapping, TileAddress,
    MAX_ZOOM_LEVEL, TILE_SIZE,
};

use crate::assembler::ImageAssembler;
use crate::cache::LevelCaches;
use crate::config::ControllerConfig;
use crate::snapshot::{TileRecord, ViewSnapshot, SNAPSHOT_VERSION};
use crate::sync;
use crate::tile::Tile;
use crate::worker::{
    ApproxJob, ApproxKind, JobQueue, RenderWorker, TileEvent, TileListener, WorkerStats,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Screen-space rectangle that needs repainting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageRect {
    pub level: u32,
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

/// A visible tile and the screen position of its top-left corner.
#[derive(Debug, Clone)]
pub struct VisibleTile {
    pub tile: Arc<Tile>,
    pub x: i64,
    pub y: i64,
}

/// Caption data: zoom level, iteration budget and the plane point under the
/// viewport center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewStatus {
    pub level: u32,
    pub max_iterations: u32,
    pub center: Complex,
}

impl fmt::Display for ViewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x{}, Iter:{}, c:{:.6}, {:.6}",
            self.level, self.max_iterations, self.center.re, self.center.im
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterestingPlace {
    pub name: &'static str,
    pub center: Complex,
    pub level: u32,
}

/// Pre-selected destinations for the "interesting places" shortcut.
pub const INTERESTING_PLACES: &[InterestingPlace] = &[
    InterestingPlace {
        name: "Whole set",
        center: Complex { re: -0.5, im: 0.0 },
        level: 0,
    },
    InterestingPlace {
        name: "Period-3 minibrot",
        center: Complex { re: -1.77, im: 0.0 },
        level: 6,
    },
    InterestingPlace {
        name: "Seahorse valley",
        center: Complex {
            re: -0.745,
            im: 0.105,
        },
        level: 8,
    },
    InterestingPlace {
        name: "Elephant valley",
        center: Complex {
            re: 0.285,
            im: 0.011,
        },
        level: 8,
    },
    InterestingPlace {
        name: "Triple spiral",
        center: Complex {
            re: -0.0886,
            im: 0.6545,
        },
        level: 9,
    },
];

// ---------------------------------------------------------------------------
// Tile ranges
// ---------------------------------------------------------------------------

/// Inclusive range of tile indices covering a virtual-pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TileRange {
    i0: i64,
    i1: i64,
    j0: i64,
    j1: i64,
}

impl TileRange {
    /// Tiles covering `[vx, vx + width) × [vy, vy + height)`; `None` when the
    /// rectangle is empty.
    pub(crate) fn covering(vx: i64, vy: i64, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let s = TILE_SIZE as i64;
        Some(Self {
            i0: vx.div_euclid(s),
            i1: (vx + width as i64 - 1).div_euclid(s),
            j0: vy.div_euclid(s),
            j1: (vy + height as i64 - 1).div_euclid(s),
        })
    }

    /// Addresses in the range, farthest from the middle first, so that the
    /// compute stack serves the middle of the range first. Coordinates
    /// outside the addressable grid are skipped.
    pub(crate) fn addresses(&self, level: u32) -> Vec<TileAddress> {
        let mid_i2 = self.i0 + self.i1;
        let mid_j2 = self.j0 + self.j1;
        let mut out = Vec::new();
        for j in self.j0..=self.j1 {
            for i in self.i0..=self.i1 {
                let (Ok(ii), Ok(jj)) = (i32::try_from(i), i32::try_from(j)) else {
                    continue;
                };
                match TileAddress::new(level, ii, jj) {
                    Ok(addr) => out.push(addr),
                    Err(e) => trace!("skipping tile outside the grid: {e}"),
                }
            }
        }
        out.sort_by_key(|a| {
            let di = 2 * a.i as i64 - mid_i2;
            let dj = 2 * a.j as i64 - mid_j2;
            std::cmp::Reverse(di * di + dj * dj)
        });
        out
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ViewState {
    pub(crate) level: u32,
    pub(crate) pan_x: i64,
    pub(crate) pan_y: i64,
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Budget for every tile requested at `level`; recomputed once per
    /// level change.
    pub(crate) max_iterations: u32,
    range: Option<TileRange>,
    visible: Vec<Arc<Tile>>,
}

impl ViewState {
    /// Virtual coordinates of screen pixel `(0, 0)`. Pan `(0, 0)` puts the
    /// virtual origin at the viewport center.
    pub(crate) fn screen_origin(&self) -> (i64, i64) {
        (
            -(self.width as i64 / 2) - self.pan_x,
            -(self.height as i64 / 2) - self.pan_y,
        )
    }

    /// Screen position of a tile's top-left corner.
    pub(crate) fn tile_screen_pos(&self, addr: &TileAddress) -> (i64, i64) {
        let (ox, oy) = self.screen_origin();
        let s = TILE_SIZE as i64;
        (addr.i as i64 * s - ox, addr.j as i64 * s - oy)
    }

    fn visible_range(&self) -> Option<TileRange> {
        let (ox, oy) = self.screen_origin();
        TileRange::covering(ox, oy, self.width, self.height)
    }

    /// Damage rectangle for `addr`, clipped to the viewport.
    fn damage_for(&self, addr: &TileAddress) -> Option<DamageRect> {
        let (x, y) = self.tile_screen_pos(addr);
        let s = TILE_SIZE as i64;
        let x0 = x.max(0);
        let y0 = y.max(0);
        let x1 = (x + s).min(self.width as i64);
        let y1 = (y + s).min(self.height as i64);
        (x1 > x0 && y1 > y0).then(|| DamageRect {
            level: addr.level,
            x: x0,
            y: y0,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    fn center(&self, mapping: &PlaneMapping) -> Complex {
        mapping.virtual_to_complex(self.level, -self.pan_x as f64, -self.pan_y as f64)
    }
}

/// State reachable from both the display thread and the worker's
/// completion callback.
pub(crate) struct ControllerShared {
    pub(crate) view: Mutex<ViewState>,
    pub(crate) caches: LevelCaches,
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) mapping: PlaneMapping,
    damage_tx: mpsc::Sender<DamageRect>,
}

impl ControllerShared {
    /// Fetch or create a tile and make sure work is pending for it.
    ///
    /// A tile with no image that is not already queued is first seeded
    /// from its coarser parent or its completed mirror, when available.
    pub(crate) fn request(&self, addr: TileAddress, max_iterations: u32) -> Option<Arc<Tile>> {
        let (tile, _) = match self.caches.level(addr.level).get_or_create(addr, max_iterations) {
            Ok(found) => found,
            Err(e) => {
                warn!(tile = %addr, "cannot create tile: {e}");
                return None;
            }
        };
        if tile.is_completed() {
            return Some(tile);
        }

        if !tile.has_image() && !tile.is_queued() {
            self.seed_approximations(&tile);
        }
        self.queue.push_compute(Arc::clone(&tile));
        Some(tile)
    }

    fn seed_approximations(&self, tile: &Arc<Tile>) {
        let addr = tile.address();
        if self.mapping.is_mirror_symmetric() {
            let mirror = self
                .caches
                .find(addr.level, tile.mirror_key(), tile.max_iterations())
                .filter(|m| m.is_completed());
            if let Some(source) = mirror {
                self.queue.push_approx(ApproxJob {
                    tile: Arc::clone(tile),
                    source,
                    kind: ApproxKind::Mirror,
                });
                return;
            }
        }
        if let Some(parent) = addr.coarser() {
            let coarser = self
                .caches
                .find(parent.level, parent.key(), iteration_budget(parent.level))
                .filter(|c| c.has_image());
            if let Some(source) = coarser {
                self.queue.push_approx(ApproxJob {
                    tile: Arc::clone(tile),
                    source,
                    kind: ApproxKind::Zoom,
                });
            }
        }
    }

    /// Recompute the visible set. Without `force`, does nothing unless the
    /// covering tile range changed.
    ///
    /// Afterwards, tiles of the current level that are off screen, hold no
    /// image, and have no pending work or pin are dropped from the cache.
    fn update_all(&self, view: &mut ViewState, force: bool) {
        let range = view.visible_range();
        if !force && range == view.range {
            return;
        }
        view.range = range;
        for tile in view.visible.drain(..) {
            tile.set_visible(false);
        }
        let Some(range) = range else {
            return;
        };

        let level = view.level;
        let budget = view.max_iterations;
        view.visible = range
            .addresses(level)
            .into_iter()
            .filter_map(|addr| self.request(addr, budget))
            .collect();
        for tile in &view.visible {
            tile.set_visible(true);
        }

        let pruned = self.caches.level(level).retain(|tile| {
            tile.is_visible() || tile.has_image() || tile.is_queued() || tile.is_pinned()
        });
        debug!(
            level,
            visible = view.visible.len(),
            pruned,
            pending = self.queue.pending_compute(),
            "visible set updated"
        );
    }

    /// Switch levels: rescale the pan, drop stale compute work, recompute
    /// the budget, and rebuild the visible set.
    fn transition(&self, view: &mut ViewState, level: u32) {
        view.pan_x = rescale_pan(view.pan_x, view.level, level);
        view.pan_y = rescale_pan(view.pan_y, view.level, level);
        self.switch_level(view, level);
        self.update_all(view, true);
    }

    /// Level switch without touching the pan or the visible set.
    fn switch_level(&self, view: &mut ViewState, level: u32) {
        let from = view.level;
        let dropped = self.queue.clear();
        view.level = level;
        self.queue.set_active_level(level);
        view.max_iterations = iteration_budget(level);
        if level.abs_diff(from) > 1 {
            self.caches.clear_except(level);
        }
        info!(
            from,
            to = level,
            max_iter = view.max_iterations,
            dropped,
            "zoom level changed"
        );
    }

    /// Worker-thread callback.
    fn on_tile_completed(&self, tile: &Arc<Tile>, event: TileEvent) {
        let view = sync::lock(&self.view);
        if tile.level() != view.level {
            trace!(tile = %tile.address(), "discarding result for an abandoned level");
            return;
        }
        if let Some(rect) = view.damage_for(&tile.address()) {
            // The receiver lives in the controller; a send error means it is
            // being torn down.
            let _ = self.damage_tx.send(rect);
        }

        if event == TileEvent::Computed && self.mapping.is_mirror_symmetric() {
            let mirror = self
                .caches
                .find(tile.level(), tile.mirror_key(), tile.max_iterations())
                .filter(|m| !m.is_completed());
            if let Some(mirror) = mirror {
                self.queue.push_approx(ApproxJob {
                    tile: mirror,
                    source: Arc::clone(tile),
                    kind: ApproxKind::Mirror,
                });
            }
        }
    }
}

struct CompletionListener {
    shared: Weak<ControllerShared>,
}

impl TileListener for CompletionListener {
    fn tile_completed(&self, tile: &Arc<Tile>, event: TileEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_tile_completed(tile, event);
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct ViewportController {
    shared: Arc<ControllerShared>,
    worker: RenderWorker,
    damage_rx: mpsc::Receiver<DamageRect>,
    config: ControllerConfig,
    next_place: usize,
}

impl ViewportController {
    pub fn new(
        config: ControllerConfig,
        mapping: PlaneMapping,
        evaluator: Arc<dyn EscapeTimeEvaluator>,
        width: u32,
        height: u32,
    ) -> crate::Result<Self> {
        let (damage_tx, damage_rx) = mpsc::channel();
        let queue = Arc::new(JobQueue::new());
        let shared = Arc::new(ControllerShared {
            view: Mutex::new(ViewState {
                level: 0,
                pan_x: 0,
                pan_y: 0,
                width,
                height,
                max_iterations: iteration_budget(0),
                range: None,
                visible: Vec::new(),
            }),
            caches: LevelCaches::new(),
            queue: Arc::clone(&queue),
            mapping,
            damage_tx,
        });
        let listener = Arc::new(CompletionListener {
            shared: Arc::downgrade(&shared),
        });
        let worker = RenderWorker::spawn(config.worker.clone(), queue, evaluator, mapping, listener)?;

        let controller = Self {
            shared,
            worker,
            damage_rx,
            config,
            next_place: 0,
        };
        controller.refresh();
        Ok(controller)
    }

    /// Controller over the default mapping with the built-in evaluator.
    pub fn with_defaults(width: u32, height: u32) -> crate::Result<Self> {
        Self::new(
            ControllerConfig::default(),
            PlaneMapping::default(),
            Arc::new(Mandelbrot),
            width,
            height,
        )
    }

    fn view(&self) -> std::sync::MutexGuard<'_, ViewState> {
        sync::lock(&self.shared.view)
    }

    /// Force a full recomputation of the visible set.
    pub fn refresh(&self) {
        let mut view = self.view();
        self.shared.update_all(&mut view, true);
    }

    /// A zero-sized viewport is legal and shows nothing.
    pub fn resize(&self, width: u32, height: u32) {
        let mut view = self.view();
        view.width = width;
        view.height = height;
        self.shared.update_all(&mut view, true);
    }

    pub fn size(&self) -> (u32, u32) {
        let view = self.view();
        (view.width, view.height)
    }

    pub fn pan(&self) -> (i64, i64) {
        let view = self.view();
        (view.pan_x, view.pan_y)
    }

    pub fn pan_to(&self, pan_x: i64, pan_y: i64) {
        let mut view = self.view();
        view.pan_x = pan_x;
        view.pan_y = pan_y;
        self.shared.update_all(&mut view, false);
    }

    pub fn pan_by(&self, dx: i64, dy: i64) {
        let mut view = self.view();
        view.pan_x += dx;
        view.pan_y += dy;
        self.shared.update_all(&mut view, false);
    }

    pub fn level(&self) -> u32 {
        self.view().level
    }

    pub fn max_iterations(&self) -> u32 {
        self.view().max_iterations
    }

    /// Step the zoom level by `delta`, keeping the plane point under the
    /// viewport center. Steps past either end of the level range are
    /// ignored. Returns the level now in effect.
    pub fn change_zoom_by(&self, delta: i32) -> u32 {
        let mut view = self.view();
        let target = i64::from(view.level) + i64::from(delta);
        let Some(level) = u32::try_from(target)
            .ok()
            .filter(|&level| level <= MAX_ZOOM_LEVEL)
        else {
            debug!(level = view.level, delta, "zoom step out of range ignored");
            return view.level;
        };
        self.zoom_to(&mut view, level);
        level
    }

    pub fn zoom_in(&self) -> u32 {
        self.change_zoom_by(1)
    }

    pub fn zoom_out(&self) -> u32 {
        self.change_zoom_by(-1)
    }

    pub fn set_zoom_level(&self, level: u32) -> crate::Result<u32> {
        let level = check_level(level)?;
        let mut view = self.view();
        self.zoom_to(&mut view, level);
        Ok(level)
    }

    /// Jumps of more than one level also drop every other level's cache.
    fn zoom_to(&self, view: &mut ViewState, level: u32) {
        if level != view.level {
            self.shared.transition(view, level);
        }
    }

    /// Pan so that `center` sits under the viewport center.
    pub fn center_on(&self, center: Complex) {
        let mut view = self.view();
        self.place_center(&mut view, center);
        self.shared.update_all(&mut view, false);
    }

    /// Switch to `level` and center on `center` in one visible-set update.
    pub fn jump_to(&self, center: Complex, level: u32) -> crate::Result<u32> {
        let level = check_level(level)?;
        let mut view = self.view();
        if level != view.level {
            self.shared.switch_level(&mut view, level);
        }
        self.place_center(&mut view, center);
        self.shared.update_all(&mut view, true);
        Ok(level)
    }

    fn place_center(&self, view: &mut ViewState, center: Complex) {
        let (vx, vy) = self.shared.mapping.complex_to_virtual(view.level, center);
        view.pan_x = -(vx.round() as i64);
        view.pan_y = -(vy.round() as i64);
    }

    pub fn jump_to_interesting_place(&mut self, index: usize) -> Option<InterestingPlace> {
        let place = *INTERESTING_PLACES.get(index)?;
        if let Err(e) = self.jump_to(place.center, place.level) {
            warn!(place = place.name, "cannot jump to place: {e}");
            return None;
        }
        self.next_place = (index + 1) % INTERESTING_PLACES.len();
        info!(place = place.name, level = place.level, "jumped to interesting place");
        Some(place)
    }

    /// Cycle through [`INTERESTING_PLACES`].
    pub fn next_interesting_place(&mut self) -> Option<InterestingPlace> {
        self.jump_to_interesting_place(self.next_place)
    }

    /// Request the tile at `(i, j)` on the current level.
    pub fn request_tile(&self, i: i32, j: i32) -> Option<Arc<Tile>> {
        let view = self.view();
        let addr = match TileAddress::new(view.level, i, j) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("cannot request tile: {e}");
                return None;
            }
        };
        self.shared.request(addr, view.max_iterations)
    }

    pub fn visible_tiles(&self) -> Vec<VisibleTile> {
        let view = self.view();
        view.visible
            .iter()
            .map(|tile| {
                let (x, y) = view.tile_screen_pos(&tile.address());
                VisibleTile {
                    tile: Arc::clone(tile),
                    x,
                    y,
                }
            })
            .collect()
    }

    /// Drain pending damage events.
    pub fn poll_damage(&self) -> Vec<DamageRect> {
        self.damage_rx.try_iter().collect()
    }

    pub fn status(&self) -> ViewStatus {
        let view = self.view();
        ViewStatus {
            level: view.level,
            max_iterations: view.max_iterations,
            center: view.center(&self.shared.mapping),
        }
    }

    pub fn snapshot(&self, include_pixels: bool) -> ViewSnapshot {
        let view = self.view();
        ViewSnapshot {
            version: SNAPSHOT_VERSION,
            zoom_level: view.level,
            pan_x: view.pan_x,
            pan_y: view.pan_y,
            tiles: view
                .visible
                .iter()
                .map(|tile| TileRecord::from_tile(tile, include_pixels))
                .collect(),
        }
    }

    /// Replace all state with a snapshot. Every record is validated before
    /// anything changes.
    pub fn restore(&self, snapshot: &ViewSnapshot) -> crate::Result<()> {
        let level = check_level(snapshot.zoom_level)?;
        let tiles = snapshot.decode_tiles()?;

        let mut view = self.view();
        self.shared.queue.clear();
        self.shared.caches.clear();
        view.level = level;
        view.pan_x = snapshot.pan_x;
        view.pan_y = snapshot.pan_y;
        view.max_iterations = iteration_budget(level);
        self.shared.queue.set_active_level(level);

        let mut adopted = Vec::new();
        for tile in tiles {
            let cache = self.shared.caches.level(tile.level());
            let tile = cache.insert(Arc::new(tile));
            if tile.has_image() {
                adopted.push(tile);
            }
        }
        info!(
            level,
            tiles = snapshot.tiles.len(),
            with_pixels = adopted.len(),
            "restored viewport snapshot"
        );
        self.shared.queue.adopt(adopted);
        self.shared.update_all(&mut view, true);
        Ok(())
    }

    pub fn assembler(&self) -> ImageAssembler {
        ImageAssembler::new(Arc::clone(&self.shared), self.config.assembler_poll())
    }

    pub fn worker(&self) -> &RenderWorker {
        &self.worker
    }

    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    pub fn set_paused(&self, paused: bool) {
        self.worker.set_paused(paused);
    }

    pub fn caches(&self) -> &LevelCaches {
        &self.shared.caches
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.shared.queue
    }

    pub fn mapping(&self) -> &PlaneMapping {
        &self.shared.mapping
    }
}

impl Drop for ViewportController {
    fn drop(&mut self) {
        self.worker.shutdown();
        self.shared.caches.clear();
    }
}
