use criterion::{criterion_group, criterion_main, Criterion};

use mandeltile_core::{
    iteration_budget, EscapeTimeEvaluator, Mandelbrot, PlaneMapping, TileAddress,
};
use mandeltile_render::{ColorMap, ComputeScratch, Palette, Tile, TileAllocator};

fn bench_tile_compute(c: &mut Criterion) {
    let mapping = PlaneMapping::default();
    let addr = TileAddress::new(2, -3, 0).unwrap();
    let budget = iteration_budget(2);
    let mut scratch = ComputeScratch::default();

    c.bench_function("tile_compute_level2", |b| {
        b.iter(|| {
            let tile = Tile::new(addr, budget).unwrap();
            tile.compute(&Mandelbrot, &mapping, &mut scratch).unwrap();
            if let Some(image) = tile.reclaim() {
                scratch.allocator.release(image);
            }
        });
    });
}

fn bench_evaluate_deep_budget(c: &mut Criterion) {
    let mapping = PlaneMapping::default();
    let addr = TileAddress::new(10, -380, -30).unwrap();
    let grid = mapping.sample_grid(&addr);
    let mut out = vec![0; grid.len()];

    c.bench_function("evaluate_128x128_1000iter", |b| {
        b.iter(|| Mandelbrot.evaluate(&grid, 1000, &mut out));
    });
}

fn bench_mirror(c: &mut Criterion) {
    let mapping = PlaneMapping::default();
    let mut scratch = ComputeScratch::default();
    let source = Tile::new(TileAddress::new(1, -2, 0).unwrap(), 21).unwrap();
    source.compute(&Mandelbrot, &mapping, &mut scratch).unwrap();
    let mirror_addr = TileAddress::new(1, -2, -1).unwrap();
    let mut alloc = TileAllocator::unbounded();

    c.bench_function("tile_from_mirror", |b| {
        b.iter(|| {
            let tile = Tile::new(mirror_addr, 21).unwrap();
            tile.from_mirror(&source, &mut alloc).unwrap();
            if let Some(image) = tile.reclaim() {
                alloc.release(image);
            }
        });
    });
}

fn bench_colorize(c: &mut Criterion) {
    let map = ColorMap::new(&Palette::default(), 256);
    let counts: Vec<u32> = (0..128 * 128).map(|n| n % 257).collect();
    let mut pixels = vec![0u8; counts.len() * 4];

    c.bench_function("colorize_tile", |b| {
        b.iter(|| map.colorize(&counts, &mut pixels));
    });
}

criterion_group!(
    benches,
    bench_tile_compute,
    bench_evaluate_deep_budget,
    bench_mirror,
    bench_colorize
);
criterion_main!(benches);
