pub mod allocator;
pub mod assembler;
pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod palette;
pub mod snapshot;
mod sync;
pub mod tile;
pub mod viewport;
pub mod worker;

pub use allocator::TileAllocator;
pub use assembler::{Assembled, AssemblyCancel, ImageAssembler};
pub use cache::{LevelCaches, TileCache};
pub use config::{ControllerConfig, WorkerConfig};
pub use error::RenderError;
pub use export::{export_png, ExportMetadata};
pub use palette::{builtin_palettes, ColorMap, Palette, CAPTURED_COLOR};
pub use snapshot::{TileRecord, ViewSnapshot, SNAPSHOT_VERSION};
pub use tile::{ComputeScratch, Tile, TilePin};
pub use viewport::{
    DamageRect, InterestingPlace, ViewStatus, ViewportController, VisibleTile,
    INTERESTING_PLACES,
};
pub use worker::{
    ApproxJob, ApproxKind, JobQueue, RenderWorker, TileEvent, TileListener, WorkerStats,
};

/// Convenience result type for the render crate.
pub type Result<T> = std::result::Result<T, RenderError>;
