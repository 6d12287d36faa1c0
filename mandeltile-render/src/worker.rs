//! The single background render worker.
//!
//! The display thread talks to the worker only through a [`JobQueue`]:
//! a most-recently-requested-first stack of compute jobs, a FIFO of
//! approximation jobs that is always served first, and a hand-off list of
//! restored tiles. The worker owns the residency list, the image allocator
//! and all scratch buffers, so no tile is ever mutated by two threads.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use mandeltile_core::{EscapeTimeEvaluator, PlaneMapping};

use crate::allocator::TileAllocator;
use crate::config::WorkerConfig;
use crate::palette::builtin_palettes;
use crate::sync;
use crate::tile::{ComputeScratch, Tile};

// ---------------------------------------------------------------------------
// Jobs and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproxKind {
    /// Copy the real-axis reflection, rows reversed.
    Mirror,
    /// Upscale a quadrant of the one-level-coarser tile.
    Zoom,
}

/// A pending approximation: seed `tile` from `source`.
#[derive(Debug, Clone)]
pub struct ApproxJob {
    pub tile: Arc<Tile>,
    pub source: Arc<Tile>,
    pub kind: ApproxKind,
}

/// What the worker just did to a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileEvent {
    Computed,
    Mirrored,
    Zoomed,
}

/// Receives a notification, on the worker thread, each time a tile gains a
/// new image.
pub trait TileListener: Send + Sync {
    fn tile_completed(&self, tile: &Arc<Tile>, event: TileEvent);
}

impl<F> TileListener for F
where
    F: Fn(&Arc<Tile>, TileEvent) + Send + Sync,
{
    fn tile_completed(&self, tile: &Arc<Tile>, event: TileEvent) {
        self(tile, event)
    }
}

#[derive(Debug)]
enum Job {
    Compute(Arc<Tile>),
    Approx(ApproxJob),
}

impl Job {
    fn tile(&self) -> &Arc<Tile> {
        match self {
            Job::Compute(tile) => tile,
            Job::Approx(job) => &job.tile,
        }
    }
}

enum Next {
    Job(Job),
    Idle,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Queues {
    /// Stack: the last element is served next.
    compute: Vec<Arc<Tile>>,
    approx: VecDeque<ApproxJob>,
    adopted: Vec<Arc<Tile>>,
    paused: bool,
    shutdown: bool,
}

/// Pending work shared between the display thread and the worker.
///
/// A tile's `queued` flag is only touched under this queue's lock and is
/// true exactly while the tile sits on the compute stack.
pub struct JobQueue {
    queues: Mutex<Queues>,
    wake: Condvar,
    active_level: AtomicU32,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            wake: Condvar::new(),
            active_level: AtomicU32::new(0),
        }
    }

    /// Push a compute job on top of the stack. A tile that is already
    /// queued moves to the top instead of being queued twice.
    pub fn push_compute(&self, tile: Arc<Tile>) {
        let mut q = sync::lock(&self.queues);
        if tile.queued.load(Ordering::Acquire) {
            if let Some(pos) = q.compute.iter().position(|t| Arc::ptr_eq(t, &tile)) {
                let tile = q.compute.remove(pos);
                q.compute.push(tile);
            }
        } else {
            tile.queued.store(true, Ordering::Release);
            q.compute.push(tile);
        }
        drop(q);
        self.wake.notify_one();
    }

    pub fn push_approx(&self, job: ApproxJob) {
        sync::lock(&self.queues).approx.push_back(job);
        self.wake.notify_one();
    }

    /// Hand tiles that already hold images to the worker's residency list.
    pub fn adopt(&self, tiles: Vec<Arc<Tile>>) {
        if tiles.is_empty() {
            return;
        }
        sync::lock(&self.queues).adopted.extend(tiles);
        self.wake.notify_one();
    }

    /// Drop every pending compute job. Approximation jobs and residency are
    /// untouched. Returns the number of jobs dropped.
    pub fn clear(&self) -> usize {
        let mut q = sync::lock(&self.queues);
        let dropped = q.compute.len();
        for tile in q.compute.drain(..) {
            tile.queued.store(false, Ordering::Release);
        }
        dropped
    }

    pub fn pending_compute(&self) -> usize {
        sync::lock(&self.queues).compute.len()
    }

    pub fn pending_approx(&self) -> usize {
        sync::lock(&self.queues).approx.len()
    }

    /// Level whose tiles proactive eviction spares.
    pub fn set_active_level(&self, level: u32) {
        self.active_level.store(level, Ordering::Release);
    }

    pub fn active_level(&self) -> u32 {
        self.active_level.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        sync::lock(&self.queues).paused = paused;
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        sync::lock(&self.queues).paused
    }

    fn shutdown(&self) {
        sync::lock(&self.queues).shutdown = true;
        self.wake.notify_all();
    }

    fn take_adopted(&self) -> Vec<Arc<Tile>> {
        std::mem::take(&mut sync::lock(&self.queues).adopted)
    }

    /// Pop the next job, blocking up to `timeout` when there is none.
    fn next(&self, timeout: Duration) -> Next {
        let mut q = sync::lock(&self.queues);
        loop {
            if q.shutdown {
                return Next::Shutdown;
            }
            if !q.paused {
                if let Some(job) = q.approx.pop_front() {
                    return Next::Job(Job::Approx(job));
                }
                if let Some(tile) = q.compute.pop() {
                    tile.queued.store(false, Ordering::Release);
                    return Next::Job(Job::Compute(tile));
                }
            }
            if !q.adopted.is_empty() {
                return Next::Idle;
            }
            let (guard, wait) = self
                .wake
                .wait_timeout(q, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            q = guard;
            if wait.timed_out() {
                return if q.shutdown { Next::Shutdown } else { Next::Idle };
            }
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    computed: AtomicU64,
    mirrored: AtomicU64,
    zoomed: AtomicU64,
    evicted: AtomicU64,
    allocation_failures: AtomicU64,
    given_up: AtomicU64,
    panics: AtomicU64,
    resident: AtomicUsize,
    live_images: AtomicUsize,
}

/// Point-in-time copy of the worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub computed: u64,
    pub mirrored: u64,
    pub zoomed: u64,
    pub evicted: u64,
    pub allocation_failures: u64,
    pub given_up: u64,
    pub panics: u64,
    pub resident: usize,
    pub live_images: usize,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            computed: self.computed.load(Ordering::Relaxed),
            mirrored: self.mirrored.load(Ordering::Relaxed),
            zoomed: self.zoomed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            given_up: self.given_up.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            resident: self.resident.load(Ordering::Relaxed),
            live_images: self.live_images.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker handle
// ---------------------------------------------------------------------------

/// Handle to the background worker thread. Dropping it stops and joins the
/// thread.
pub struct RenderWorker {
    queue: Arc<JobQueue>,
    counters: Arc<Counters>,
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RenderWorker {
    pub fn spawn(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        evaluator: Arc<dyn EscapeTimeEvaluator>,
        mapping: PlaneMapping,
        listener: Arc<dyn TileListener>,
    ) -> crate::Result<Self> {
        let counters = Arc::new(Counters::default());
        let stopped = Arc::new(AtomicBool::new(false));
        let mut worker = WorkerLoop::new(
            config,
            Arc::clone(&queue),
            evaluator,
            mapping,
            listener,
            Arc::clone(&counters),
        );
        let stopped_flag = Arc::clone(&stopped);

        let handle = std::thread::Builder::new()
            .name("render-worker".into())
            .spawn(move || {
                info!(evaluator = worker.evaluator.name(), "render worker started");
                while worker.step() {}
                stopped_flag.store(true, Ordering::Release);
                info!("render worker stopped");
            })?;

        Ok(Self {
            queue,
            counters,
            stopped,
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn schedule(&self, tile: Arc<Tile>) {
        self.queue.push_compute(tile);
    }

    pub fn schedule_approx(&self, job: ApproxJob) {
        self.queue.push_approx(job);
    }

    pub fn clear(&self) -> usize {
        self.queue.clear()
    }

    pub fn set_active_level(&self, level: u32) {
        self.queue.set_active_level(level);
    }

    pub fn set_paused(&self, paused: bool) {
        self.queue.set_paused(paused);
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.stopped.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for the current job to finish.
    pub fn shutdown(&mut self) {
        self.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("render worker thread panicked outside a job");
            }
        }
    }
}

impl Drop for RenderWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// State owned by the worker thread.
struct WorkerLoop {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    evaluator: Arc<dyn EscapeTimeEvaluator>,
    mapping: PlaneMapping,
    listener: Arc<dyn TileListener>,
    counters: Arc<Counters>,
    scratch: ComputeScratch,
    /// Realized tiles, oldest first.
    residency: VecDeque<Arc<Tile>>,
}

impl WorkerLoop {
    fn new(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        evaluator: Arc<dyn EscapeTimeEvaluator>,
        mapping: PlaneMapping,
        listener: Arc<dyn TileListener>,
        counters: Arc<Counters>,
    ) -> Self {
        let palette = builtin_palettes()
            .into_iter()
            .nth(config.palette_index)
            .unwrap_or_default();
        let scratch = ComputeScratch::new(palette, TileAllocator::new(config.tile_capacity));
        Self {
            config,
            queue,
            evaluator,
            mapping,
            listener,
            counters,
            scratch,
            residency: VecDeque::new(),
        }
    }

    /// One loop iteration. Returns `false` once shut down.
    fn step(&mut self) -> bool {
        self.absorb_adopted();

        if self.residency.len() > self.config.high_water_mark {
            let target = self.residency.len() / 2;
            self.evict(target, "high water mark");
        }

        match self.queue.next(self.config.idle_timeout()) {
            Next::Shutdown => false,
            Next::Idle => true,
            Next::Job(job) => {
                self.run_job(job);
                true
            }
        }
    }

    fn absorb_adopted(&mut self) {
        for tile in self.queue.take_adopted() {
            if tile.has_image() && !tile.is_resident() {
                self.scratch.allocator.adopt(1);
            }
            self.mark_resident(tile);
        }
        self.publish_residency();
    }

    /// Run one job, containing any panic to this tile.
    fn run_job(&mut self, job: Job) {
        let address = job.tile().address();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.attempt(&job)));
        if let Err(payload) = outcome {
            self.counters.panics.fetch_add(1, Ordering::Relaxed);
            error!(
                tile = %address,
                "panic while processing tile: {}",
                panic_message(payload.as_ref())
            );
            self.resync_allocator();
        }
        self.publish_residency();
    }

    /// Bounded retry: an allocation failure evicts and tries again, up to
    /// `max_attempts`. Any other error drops the job.
    fn attempt(&mut self, job: &Job) {
        let tile = job.tile();
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.process(job) {
                Ok(Some(event)) => {
                    self.mark_resident(Arc::clone(tile));
                    self.count(event);
                    self.listener.tile_completed(tile, event);
                    return;
                }
                Ok(None) => return,
                Err(e) if e.is_allocation_failure() => {
                    self.counters
                        .allocation_failures
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(tile = %tile.address(), attempt, "allocation failed, evicting");
                    self.relieve_pressure();
                }
                Err(e) => {
                    warn!(tile = %tile.address(), "tile job failed: {e}");
                    return;
                }
            }
        }
        self.counters.given_up.fetch_add(1, Ordering::Relaxed);
        warn!(
            tile = %tile.address(),
            attempts,
            "giving up on tile after repeated allocation failures"
        );
    }

    fn process(&mut self, job: &Job) -> crate::Result<Option<TileEvent>> {
        let event = match job {
            Job::Compute(tile) => tile
                .compute(self.evaluator.as_ref(), &self.mapping, &mut self.scratch)?
                .then_some(TileEvent::Computed),
            Job::Approx(ApproxJob {
                tile,
                source,
                kind: ApproxKind::Mirror,
            }) => tile
                .from_mirror(source, &mut self.scratch.allocator)?
                .then_some(TileEvent::Mirrored),
            Job::Approx(ApproxJob {
                tile,
                source,
                kind: ApproxKind::Zoom,
            }) => tile
                .zoom_from_coarser(source, &mut self.scratch.allocator)?
                .then_some(TileEvent::Zoomed),
        };
        Ok(event)
    }

    fn count(&self, event: TileEvent) {
        let counter = match event {
            TileEvent::Computed => &self.counters.computed,
            TileEvent::Mirrored => &self.counters.mirrored,
            TileEvent::Zoomed => &self.counters.zoomed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Put `tile` at the young end of the residency list.
    fn mark_resident(&mut self, tile: Arc<Tile>) {
        if tile.resident.swap(true, Ordering::AcqRel) {
            if let Some(pos) = self.residency.iter().position(|t| Arc::ptr_eq(t, &tile)) {
                self.residency.remove(pos);
            }
        }
        self.residency.push_back(tile);
    }

    /// Reclaim up to `target` tiles, oldest first. Tiles on the active level
    /// are spared unless nothing but this list still references them (their
    /// cache was dropped). Returns the number of tiles evicted.
    fn evict(&mut self, target: usize, reason: &'static str) -> usize {
        let active = self.queue.active_level();
        self.evict_where(target, reason, |tile| {
            tile.level() != active || Arc::strong_count(tile) == 1
        })
    }

    /// Make room after a failed allocation.
    ///
    /// Inactive levels go first, then active-level tiles that are neither
    /// visible nor pinned, and only when both free nothing, a single visible
    /// one. A pinned tile is reclaimable while it holds only an
    /// approximation.
    fn relieve_pressure(&mut self) -> usize {
        let target = (self.residency.len() / 2).max(1);
        let mut evicted = self.evict(target, "allocation failure");
        if evicted < target {
            evicted += self.evict_where(
                target - evicted,
                "allocation failure, off-screen",
                |tile| !tile.is_visible() && reclaimable(tile),
            );
        }
        if evicted == 0 {
            evicted = self.evict_where(1, "allocation failure, on-screen", |tile| {
                reclaimable(tile)
            });
        }
        evicted
    }

    fn evict_where(
        &mut self,
        target: usize,
        reason: &'static str,
        eligible: impl Fn(&Arc<Tile>) -> bool,
    ) -> usize {
        let mut kept = VecDeque::with_capacity(self.residency.len());
        let mut evicted = 0;

        while let Some(tile) = self.residency.pop_front() {
            if evicted < target && eligible(&tile) {
                tile.resident.store(false, Ordering::Release);
                if let Some(image) = tile.reclaim() {
                    self.scratch.allocator.release(image);
                }
                evicted += 1;
            } else {
                kept.push_back(tile);
            }
        }
        self.residency = kept;

        self.counters
            .evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        self.publish_residency();
        if evicted > 0 {
            info!(
                evicted,
                remaining = self.residency.len(),
                active_level = self.queue.active_level(),
                reason,
                "evicted tiles"
            );
        }
        evicted
    }

    /// After a panic an allocation may have been dropped without being
    /// returned; recount from the tiles that actually hold images.
    fn resync_allocator(&mut self) {
        let live = self.residency.iter().filter(|t| t.has_image()).count();
        self.scratch.allocator.reset_live(live);
    }

    fn publish_residency(&self) {
        self.counters
            .resident
            .store(self.residency.len(), Ordering::Relaxed);
        self.counters
            .live_images
            .store(self.scratch.allocator.live(), Ordering::Relaxed);
    }

    #[cfg(test)]
    fn resident_addresses(&self) -> Vec<mandeltile_core::TileAddress> {
        self.residency.iter().map(|t| t.address()).collect()
    }
}

/// Evicting this tile cannot take away a completed image someone pinned.
fn reclaimable(tile: &Tile) -> bool {
    !tile.is_pinned() || !tile.is_completed()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
