//! Tunables for the render worker and the viewport controller.
//!
//! Every field has a serde default, so a partial JSON object (or an older
//! preferences file) still deserializes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Resident tile count above which the worker evicts proactively.
    pub high_water_mark: usize,
    /// Hard cap on live tile images; allocation beyond it fails.
    pub tile_capacity: usize,
    /// Attempts per job before it is dropped.
    pub max_attempts: u32,
    /// Idle wake-up period when both queues are empty.
    pub idle_timeout_ms: u64,
    /// Index into [`builtin_palettes`](crate::palette::builtin_palettes).
    pub palette_index: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 300,
            tile_capacity: 384,
            max_attempts: 2,
            idle_timeout_ms: 5000,
            palette_index: 0,
        }
    }
}

impl WorkerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub worker: WorkerConfig,
    /// Poll period of the image assembler.
    pub assembler_poll_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            assembler_poll_ms: 10,
        }
    }
}

impl ControllerConfig {
    pub fn assembler_poll(&self) -> Duration {
        Duration::from_millis(self.assembler_poll_ms.max(1))
    }
}
