//! Per-level tile caches.
//!
//! Each cache is one coarse `Mutex` around a map; contention is negligible
//! next to tile compute. Lock order across the crate is
//! zoom state → [`LevelCaches`] → [`TileCache`] → job queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mandeltile_core::{TileAddress, TileKey};

use crate::sync;
use crate::tile::Tile;

/// Identity of a tile within one level.
type CacheKey = (TileKey, u32);

/// Deduplicating map from address to live [`Tile`] for a single zoom level.
#[derive(Debug)]
pub struct TileCache {
    level: u32,
    tiles: Mutex<HashMap<CacheKey, Arc<Tile>>>,
}

impl TileCache {
    pub fn new(level: u32) -> Self {
        Self {
            level,
            tiles: Mutex::new(HashMap::new()),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Fetch the tile for `(address, max_iterations)`, creating it on first
    /// request. The flag is `true` when the tile was created by this call.
    pub fn get_or_create(
        &self,
        address: TileAddress,
        max_iterations: u32,
    ) -> crate::Result<(Arc<Tile>, bool)> {
        debug_assert_eq!(address.level, self.level);
        let mut tiles = sync::lock(&self.tiles);
        if let Some(tile) = tiles.get(&(address.key(), max_iterations)) {
            return Ok((Arc::clone(tile), false));
        }
        let tile = Arc::new(Tile::new(address, max_iterations)?);
        tiles.insert((address.key(), max_iterations), Arc::clone(&tile));
        Ok((tile, true))
    }

    pub fn get(&self, key: TileKey, max_iterations: u32) -> Option<Arc<Tile>> {
        sync::lock(&self.tiles).get(&(key, max_iterations)).cloned()
    }

    /// Insert a prebuilt tile (snapshot restore). An existing entry for the
    /// same address is kept and returned instead.
    pub fn insert(&self, tile: Arc<Tile>) -> Arc<Tile> {
        debug_assert_eq!(tile.level(), self.level);
        let mut tiles = sync::lock(&self.tiles);
        Arc::clone(
            tiles
                .entry((tile.key(), tile.max_iterations()))
                .or_insert(tile),
        )
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.tiles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry `keep` rejects. Returns how many were dropped.
    pub fn retain(&self, mut keep: impl FnMut(&Arc<Tile>) -> bool) -> usize {
        let mut tiles = sync::lock(&self.tiles);
        let before = tiles.len();
        tiles.retain(|_, tile| keep(tile));
        before - tiles.len()
    }

    pub fn tiles(&self) -> Vec<Arc<Tile>> {
        sync::lock(&self.tiles).values().cloned().collect()
    }

    pub fn clear(&self) {
        sync::lock(&self.tiles).clear();
    }
}

/// One [`TileCache`] per zoom level, created on demand.
#[derive(Debug, Default)]
pub struct LevelCaches {
    levels: Mutex<HashMap<u32, Arc<TileCache>>>,
}

impl LevelCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache for `level`, created if missing.
    pub fn level(&self, level: u32) -> Arc<TileCache> {
        let mut levels = sync::lock(&self.levels);
        Arc::clone(
            levels
                .entry(level)
                .or_insert_with(|| Arc::new(TileCache::new(level))),
        )
    }

    /// Cache for `level` if one exists.
    pub fn lookup(&self, level: u32) -> Option<Arc<TileCache>> {
        sync::lock(&self.levels).get(&level).cloned()
    }

    /// Find a live tile anywhere in the hierarchy.
    pub fn find(&self, level: u32, key: TileKey, max_iterations: u32) -> Option<Arc<Tile>> {
        self.lookup(level)?.get(key, max_iterations)
    }

    pub fn clear_level(&self, level: u32) {
        if let Some(cache) = sync::lock(&self.levels).remove(&level) {
            cache.clear();
        }
    }

    /// Drop every level except `keep`.
    pub fn clear_except(&self, keep: u32) {
        let mut levels = sync::lock(&self.levels);
        levels.retain(|&level, cache| {
            if level == keep {
                true
            } else {
                cache.clear();
                false
            }
        });
    }

    pub fn clear(&self) {
        let mut levels = sync::lock(&self.levels);
        for cache in levels.values() {
            cache.clear();
        }
        levels.clear();
    }

    /// Levels that currently have a cache, ascending.
    pub fn levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = sync::lock(&self.levels).keys().copied().collect();
        levels.sort_unstable();
        levels
    }

    /// Total tiles across all levels.
    pub fn tile_count(&self) -> usize {
        sync::lock(&self.levels).values().map(|c| c.len()).sum()
    }
}
