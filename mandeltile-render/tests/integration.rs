use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mandeltile_core::{
    escape_time, Complex, Mandelbrot, PlaneMapping, TileAddress, TILE_SIZE,
};
use mandeltile_render::{
    AssemblyCancel, ColorMap, ControllerConfig, JobQueue, Palette, RenderError, RenderWorker,
    TileCache, TileEvent, TileListener, ViewSnapshot, ViewportController, WorkerConfig,
    CAPTURED_COLOR,
};

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(30) {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn quiet_listener() -> Arc<dyn TileListener> {
    Arc::new(|_: &Arc<mandeltile_render::Tile>, _: TileEvent| {})
}

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        worker: WorkerConfig {
            idle_timeout_ms: 20,
            ..Default::default()
        },
        assembler_poll_ms: 2,
    }
}

fn controller(width: u32, height: u32) -> ViewportController {
    ViewportController::new(
        fast_config(),
        PlaneMapping::default(),
        Arc::new(Mandelbrot),
        width,
        height,
    )
    .unwrap()
}

fn controller_with_capacity(tile_capacity: usize, width: u32, height: u32) -> ViewportController {
    let mut config = fast_config();
    config.worker.tile_capacity = tile_capacity;
    ViewportController::new(
        config,
        PlaneMapping::default(),
        Arc::new(Mandelbrot),
        width,
        height,
    )
    .unwrap()
}

fn all_visible_completed(controller: &ViewportController) -> bool {
    controller
        .visible_tiles()
        .iter()
        .all(|v| v.tile.is_completed())
}

#[test]
fn classic_view_tile_center_is_captured_and_corner_escapes() {
    let mapping = PlaneMapping::centered_on(Complex::new(-0.5, 0.0), 3.0).unwrap();
    let queue = Arc::new(JobQueue::new());
    let _worker = RenderWorker::spawn(
        WorkerConfig::default(),
        Arc::clone(&queue),
        Arc::new(Mandelbrot),
        mapping,
        quiet_listener(),
    )
    .unwrap();

    let cache = TileCache::new(0);
    let addr = TileAddress::new(0, 0, 0).unwrap();
    let (tile, created) = cache.get_or_create(addr, 20).unwrap();
    assert!(created);
    queue.push_compute(Arc::clone(&tile));
    assert!(wait_until(|| tile.is_completed()));

    let image = tile.image().unwrap();
    let mid = TILE_SIZE / 2;
    assert_eq!(image.get_pixel(mid, mid).0, CAPTURED_COLOR);

    let corner = escape_time(mapping.sample_grid(&addr).point(0, 0), 20);
    assert!(corner < 10, "corner took {corner} iterations");
    let map = ColorMap::new(&Palette::default(), 20);
    assert_eq!(image.get_pixel(0, 0).0, map.color(corner));
}

#[test]
fn zoom_change_drops_pending_compute_but_keeps_realized_tiles() {
    let controller = controller(0, 0);

    let realized: Vec<_> = (0..2)
        .map(|i| controller.request_tile(i, 0).unwrap())
        .collect();
    assert!(wait_until(|| realized.iter().all(|t| t.is_completed())));

    controller.set_paused(true);
    let mut scheduled = Vec::new();
    for i in -25..25 {
        for j in 2..12 {
            scheduled.push(controller.request_tile(i, j).unwrap());
        }
    }
    assert_eq!(scheduled.len(), 500);
    assert_eq!(controller.queue().pending_compute(), 500);

    assert_eq!(controller.zoom_in(), 1);
    assert_eq!(controller.queue().pending_compute(), 0);
    assert!(scheduled.iter().all(|t| !t.is_queued()));

    let old = controller.caches().lookup(0).expect("old level cache survives");
    for tile in &realized {
        let cached = old.get(tile.key(), tile.max_iterations()).unwrap();
        assert!(Arc::ptr_eq(&cached, tile));
        assert!(cached.is_completed());
    }
}

#[test]
fn symmetric_pairs_are_mirrored_not_recomputed() {
    let controller = controller(256, 256);
    assert_eq!(controller.visible_tiles().len(), 4);
    assert!(wait_until(|| all_visible_completed(&controller)));
    assert!(wait_until(|| {
        let stats = controller.stats();
        stats.computed + stats.mirrored == 4
    }));
    let stats = controller.stats();
    assert!(stats.mirrored >= 1, "{stats:?}");

    let caches = controller.caches();
    let cache = caches.lookup(0).unwrap();
    let budget = controller.max_iterations();
    let top = cache.get(TileAddress::new(0, 0, -1).unwrap().key(), budget).unwrap();
    let bottom = cache.get(TileAddress::new(0, 0, 0).unwrap().key(), budget).unwrap();
    let (top, bottom) = (top.image().unwrap(), bottom.image().unwrap());
    for y in 0..TILE_SIZE {
        for x in [0, 17, TILE_SIZE - 1] {
            assert_eq!(top.get_pixel(x, y), bottom.get_pixel(x, TILE_SIZE - 1 - y));
        }
    }

    let mut damage = Vec::new();
    assert!(wait_until(|| {
        damage.extend(controller.poll_damage());
        damage.len() >= 4
    }));
    assert!(damage.iter().all(|d| d.level == 0 && d.width == 128 && d.height == 128));
}

#[test]
fn results_for_an_abandoned_level_raise_no_damage() {
    let controller = controller(256, 256);
    controller.set_paused(true);
    let stale = controller.request_tile(5, 5).unwrap();
    controller.zoom_in();
    // Anything finished before the switch was still current.
    controller.poll_damage();
    controller.queue().push_compute(Arc::clone(&stale));
    controller.set_paused(false);

    assert!(wait_until(|| stale.is_completed() && all_visible_completed(&controller)));
    std::thread::sleep(Duration::from_millis(50));
    let damage = controller.poll_damage();
    assert!(!damage.is_empty());
    assert!(damage.iter().all(|d| d.level == 1));
}

#[test]
fn evicted_tiles_come_back_fresh() {
    let queue = Arc::new(JobQueue::new());
    let config = WorkerConfig {
        high_water_mark: 2,
        idle_timeout_ms: 10,
        ..Default::default()
    };
    let worker = RenderWorker::spawn(
        config,
        Arc::clone(&queue),
        Arc::new(Mandelbrot),
        PlaneMapping::default(),
        quiet_listener(),
    )
    .unwrap();
    worker.set_active_level(1);

    let cache = TileCache::new(0);
    let budget = mandeltile_core::iteration_budget(0);
    for i in 0..8 {
        let (tile, _) = cache
            .get_or_create(TileAddress::new(0, i, 0).unwrap(), budget)
            .unwrap();
        worker.schedule(tile);
    }
    assert!(wait_until(|| worker.stats().computed == 8));
    assert!(wait_until(|| worker.stats().evicted >= 1));

    let keys: HashSet<_> = cache.tiles().iter().map(|t| t.key()).collect();
    assert_eq!(keys.len(), cache.len());

    let evicted = cache
        .tiles()
        .into_iter()
        .find(|t| !t.has_image())
        .expect("some tile was evicted");
    let (again, created) = cache.get_or_create(evicted.address(), budget).unwrap();
    assert!(!created);
    assert!(!again.is_completed());

    worker.schedule(Arc::clone(&again));
    assert!(wait_until(|| again.is_completed()));
}

#[test]
fn zoom_in_then_out_restores_pan() {
    let controller = controller(0, 0);
    controller.set_zoom_level(1).unwrap();
    controller.pan_to(37, -21);

    controller.zoom_in();
    assert_eq!(controller.pan(), (74, -42));
    controller.zoom_out();
    assert_eq!(controller.pan(), (37, -21));

    // Out-then-in floors odd offsets.
    controller.zoom_out();
    controller.zoom_in();
    assert_eq!(controller.pan(), (36, -22));
}

#[test]
fn zoom_steps_past_the_range_are_ignored() {
    let controller = controller(0, 0);
    assert_eq!(controller.zoom_out(), 0);
    assert!(controller.set_zoom_level(99).is_err());
    assert_eq!(controller.set_zoom_level(4).unwrap(), 4);
    assert_eq!(controller.max_iterations(), mandeltile_core::iteration_budget(4));
}

#[test]
fn status_reports_center_and_budget() {
    let controller = controller(200, 100);
    controller.set_paused(true);
    controller.center_on(Complex::new(-0.75, 0.125));
    let status = controller.status();
    assert_eq!(status.level, 0);
    assert_eq!(status.max_iterations, 15);
    let step = 2.0 / TILE_SIZE as f64;
    assert!((status.center.re + 0.75).abs() <= step);
    assert!((status.center.im - 0.125).abs() <= step);
    assert!(status.to_string().starts_with("x0, Iter:15, c:"));
}

#[test]
fn jump_leaves_only_the_target_view_pending() {
    let controller = controller(256, 256);
    controller.set_paused(true);
    assert_eq!(controller.jump_to(Complex::new(-0.745, 0.105), 5).unwrap(), 5);
    let visible = controller.visible_tiles();
    assert!(!visible.is_empty());
    assert!(visible.iter().all(|v| v.tile.level() == 5));
    assert_eq!(controller.queue().pending_compute(), visible.len());
    assert!(controller.caches().lookup(0).is_none());
}

#[test]
fn interesting_places_cycle() {
    let mut controller = controller(0, 0);
    controller.set_paused(true);
    let first = controller.next_interesting_place().unwrap();
    assert_eq!(first.level, 0);
    let second = controller.next_interesting_place().unwrap();
    assert_eq!(controller.level(), second.level);
    assert!((controller.status().center.re - second.center.re).abs() < 1e-3);
}

#[test]
fn assembler_composites_every_tile() {
    let controller = controller(200, 150);
    let assembler = controller.assembler();
    let cancel = AssemblyCancel::new();

    let assembled = assembler.assemble_centered(300, 200, &cancel).unwrap();
    assert_eq!(assembled.image.dimensions(), (300, 200));
    assert!(assembled.image.pixels().all(|p| p.0[3] == 255));
    let (done, total) = cancel.progress();
    assert_eq!(done, total);
    assert_eq!(total, assembled.tiles);
}

#[test]
fn cancelled_assembly_returns_no_image() {
    let controller = controller(200, 150);
    controller.set_paused(true);
    let cancel = AssemblyCancel::new();
    cancel.cancel();
    let result = controller.assembler().capture(&cancel);
    assert!(matches!(result, Err(RenderError::Cancelled)));
}

#[test]
fn snapshot_restores_without_recomputing() {
    let source = controller(256, 256);
    source.zoom_in();
    source.pan_by(-40, 10);
    assert!(wait_until(|| all_visible_completed(&source)));
    let json = source.snapshot(true).to_json().unwrap();

    let target = controller(256, 256);
    target.set_paused(true);
    let snapshot = ViewSnapshot::from_json(&json).unwrap();
    target.restore(&snapshot).unwrap();

    assert_eq!(target.level(), 1);
    assert_eq!(target.pan(), source.pan());
    let restored = target.visible_tiles();
    assert_eq!(restored.len(), source.visible_tiles().len());
    assert!(restored.iter().all(|v| v.tile.is_completed()));
}

#[test]
fn snapshot_with_wrong_tile_size_is_rejected() {
    let source = controller(128, 128);
    source.set_paused(true);
    let mut snapshot = source.snapshot(false);
    assert!(!snapshot.tiles.is_empty());
    snapshot.tiles[0].tile_size = 64;

    let target = controller(128, 128);
    assert!(matches!(
        target.restore(&snapshot),
        Err(RenderError::SnapshotTileSize { found: 64, .. })
    ));
}

#[test]
fn zoom_in_shows_upscaled_placeholders_until_computed() {
    let controller = controller(256, 256);
    assert!(wait_until(|| all_visible_completed(&controller)));

    controller.set_paused(true);
    assert_eq!(controller.zoom_in(), 1);
    let visible = controller.visible_tiles();
    assert_eq!(visible.len(), 4);
    assert!(visible.iter().all(|v| !v.tile.is_completed()));
    assert_eq!(controller.queue().pending_approx(), 4);
    controller.poll_damage();
    controller.set_paused(false);

    assert!(wait_until(|| controller.stats().zoomed == 4));
    assert!(wait_until(|| all_visible_completed(&controller)));
    let mut damage = Vec::new();
    assert!(wait_until(|| {
        damage.extend(controller.poll_damage());
        damage.len() >= 4
    }));
    assert!(damage.iter().all(|d| d.level == 1));
}

#[test]
fn assembly_larger_than_tile_capacity_completes() {
    let controller = controller_with_capacity(4, 128, 128);
    let assembler = controller.assembler();
    let cancel = AssemblyCancel::new();
    let finished = AtomicBool::new(false);

    let result = std::thread::scope(|s| {
        s.spawn(|| {
            if !wait_until(|| finished.load(Ordering::Acquire)) {
                cancel.cancel();
            }
        });
        let result = assembler.assemble_centered(384, 384, &cancel);
        finished.store(true, Ordering::Release);
        result
    });
    let assembled = result.unwrap();

    assert_eq!(assembled.tiles, 16);
    assert_eq!(cancel.progress(), (16, 16));
    assert!(assembled.image.pixels().all(|p| p.0[3] == 255));
    let stats = controller.stats();
    assert!(stats.evicted > 0, "{stats:?}");
    assert!(stats.live_images <= 4, "{stats:?}");
}

#[test]
fn tile_given_up_under_pressure_is_realized_once_panned_into_view() {
    let controller = controller_with_capacity(1, 1, 1);
    let visible = controller.visible_tiles();
    assert_eq!(visible.len(), 1);
    let shown = Arc::clone(&visible[0].tile);
    assert_eq!(shown.address(), TileAddress::new(0, 0, 0).unwrap());
    assert!(wait_until(|| shown.is_completed()));

    let pin = shown.pin();
    let starved = controller.request_tile(1, 0).unwrap();
    assert!(wait_until(|| controller.stats().given_up >= 1));
    assert!(!starved.has_image());
    assert!(!starved.is_queued());

    drop(pin);
    controller.pan_by(-(TILE_SIZE as i64), 0);
    let visible = controller.visible_tiles();
    assert!(Arc::ptr_eq(&visible[0].tile, &starved));
    assert!(wait_until(|| starved.is_completed()));
    assert!(!shown.has_image());
    assert_eq!(controller.stats().given_up, 1);
}

#[test]
fn panning_drops_abandoned_placeholder_tiles() {
    let controller = controller(256, 256);
    assert!(wait_until(|| all_visible_completed(&controller)));
    controller.set_paused(true);

    controller.pan_to(10_000, 0);
    controller.pan_to(20_000, 0);
    assert!(controller.queue().pending_compute() > 0);
    controller.queue().clear();
    controller.pan_to(30_000, 0);

    let cache = controller.caches().lookup(0).unwrap();
    let visible = controller.visible_tiles();
    assert_eq!(cache.len(), visible.len() + 4);
    assert!(cache.tiles().iter().all(|t| t.is_visible() || t.has_image()));
}
