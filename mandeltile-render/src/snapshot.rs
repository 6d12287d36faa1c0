//! Viewport snapshots for suspend/resume.
//!
//! A snapshot is short-lived JSON: the zoom level, the pan offset and one
//! versioned record per visible tile, optionally carrying the raw RGBA
//! pixels as base64. Readers reject records whose version or tile size do
//! not match instead of guessing.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use mandeltile_core::{TileAddress, TileKey, TILE_SIZE};

use crate::error::RenderError;
use crate::tile::Tile;

/// Record format version.
pub const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub version: u32,
    pub tile_size: u32,
    /// Packed key, cross-checked against `i`/`j` on read.
    pub key: u32,
    pub level: u32,
    pub i: i32,
    pub j: i32,
    pub max_iterations: u32,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixels: Option<String>,
}

impl TileRecord {
    pub fn from_tile(tile: &Tile, include_pixels: bool) -> Self {
        let address = tile.address();
        let (image, completed) = tile.snapshot();
        let pixels = image
            .filter(|_| include_pixels)
            .map(|img| BASE64.encode(img.as_raw()));
        Self {
            version: SNAPSHOT_VERSION,
            tile_size: TILE_SIZE,
            key: tile.key().raw(),
            level: address.level,
            i: address.i,
            j: address.j,
            max_iterations: tile.max_iterations(),
            // Completion is meaningless without the pixels it vouches for.
            completed: completed && pixels.is_some(),
            pixels,
        }
    }

    /// Check the header fields without decoding pixels.
    pub fn validate(&self) -> crate::Result<TileAddress> {
        if self.version != SNAPSHOT_VERSION {
            return Err(RenderError::SnapshotVersion {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        if self.tile_size != TILE_SIZE {
            return Err(RenderError::SnapshotTileSize {
                found: self.tile_size,
                expected: TILE_SIZE,
            });
        }
        let address = TileAddress::new(self.level, self.i, self.j)?;
        if TileKey::from_raw(self.key) != address.key() {
            return Err(RenderError::SnapshotPayload(format!(
                "key {:08x} does not match tile {address}",
                self.key
            )));
        }
        Ok(address)
    }

    /// Rebuild the tile this record describes.
    pub fn to_tile(&self) -> crate::Result<Tile> {
        let address = self.validate()?;
        let Some(encoded) = &self.pixels else {
            return Tile::new(address, self.max_iterations);
        };

        let raw = BASE64
            .decode(encoded)
            .map_err(|e| RenderError::SnapshotPayload(format!("tile {address}: {e}")))?;
        let expected = (TILE_SIZE * TILE_SIZE * 4) as usize;
        if raw.len() != expected {
            return Err(RenderError::SnapshotPayload(format!(
                "tile {address}: {} pixel bytes, expected {expected}",
                raw.len()
            )));
        }
        let image = RgbaImage::from_raw(TILE_SIZE, TILE_SIZE, raw).ok_or(
            RenderError::InvalidDimensions {
                width: TILE_SIZE,
                height: TILE_SIZE,
            },
        )?;
        Tile::with_image(address, self.max_iterations, image, self.completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    pub version: u32,
    pub zoom_level: u32,
    pub pan_x: i64,
    pub pan_y: i64,
    pub tiles: Vec<TileRecord>,
}

impl ViewSnapshot {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(RenderError::SnapshotVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }

    /// Decode every record, failing on the first bad one.
    pub fn decode_tiles(&self) -> crate::Result<Vec<Tile>> {
        self.tiles.iter().map(TileRecord::to_tile).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::ComputeScratch;
    use mandeltile_core::{Mandelbrot, PlaneMapping};

    fn computed_tile() -> Tile {
        let tile = Tile::new(TileAddress::new(1, -2, 0).unwrap(), 21).unwrap();
        let mut scratch = ComputeScratch::default();
        tile.compute(&Mandelbrot, &PlaneMapping::default(), &mut scratch)
            .unwrap();
        tile
    }

    #[test]
    fn record_restores_pixels_and_completion() {
        let tile = computed_tile();
        let record = TileRecord::from_tile(&tile, true);
        let back = record.to_tile().unwrap();

        assert_eq!(back.address(), tile.address());
        assert!(back.is_completed());
        assert_eq!(
            back.image().unwrap().as_raw(),
            tile.image().unwrap().as_raw()
        );
    }

    #[test]
    fn record_without_pixels_is_not_completed() {
        let record = TileRecord::from_tile(&computed_tile(), false);
        assert!(record.pixels.is_none());
        assert!(!record.completed);
        let back = record.to_tile().unwrap();
        assert!(!back.has_image());
    }

    #[test]
    fn mismatched_version_is_rejected() {
        let mut record = TileRecord::from_tile(&computed_tile(), false);
        record.version = 1;
        assert!(matches!(
            record.to_tile(),
            Err(RenderError::SnapshotVersion { found: 1, .. })
        ));
    }

    #[test]
    fn mismatched_tile_size_is_rejected() {
        let mut record = TileRecord::from_tile(&computed_tile(), false);
        record.tile_size = 256;
        assert!(matches!(
            record.to_tile(),
            Err(RenderError::SnapshotTileSize { found: 256, .. })
        ));
    }

    #[test]
    fn tampered_key_or_payload_is_rejected() {
        let mut record = TileRecord::from_tile(&computed_tile(), true);
        record.key ^= 1;
        assert!(matches!(
            record.to_tile(),
            Err(RenderError::SnapshotPayload(_))
        ));

        let mut record = TileRecord::from_tile(&computed_tile(), true);
        record.pixels = Some(BASE64.encode([0u8; 16]));
        assert!(matches!(
            record.to_tile(),
            Err(RenderError::SnapshotPayload(_))
        ));
    }

    #[test]
    fn snapshot_json_round_trip() {
        let snapshot = ViewSnapshot {
            version: SNAPSHOT_VERSION,
            zoom_level: 1,
            pan_x: -40,
            pan_y: 12,
            tiles: vec![TileRecord::from_tile(&computed_tile(), false)],
        };
        let json = snapshot.to_json().unwrap();
        assert_eq!(ViewSnapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn snapshot_with_old_version_is_rejected() {
        let json = r#"{"version":1,"zoom_level":0,"pan_x":0,"pan_y":0,"tiles":[]}"#;
        assert!(matches!(
            ViewSnapshot::from_json(json),
            Err(RenderError::SnapshotVersion { found: 1, .. })
        ));
    }
}
