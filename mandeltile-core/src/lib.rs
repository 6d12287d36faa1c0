pub mod address;
pub mod complex;
pub mod error;
pub mod evaluator;
pub mod plane;
pub mod zoom;

// Re-export primary types for convenience.
pub use address::{TileAddress, TileKey};
pub use complex::Complex;
pub use error::CoreError;
pub use evaluator::{escape_time, EscapeTimeEvaluator, Mandelbrot};
pub use plane::{PlaneMapping, SampleGrid, TILE_SIZE};
pub use zoom::{iteration_budget, zoom_factor, MAX_ZOOM_LEVEL};

/// Convenience result type for the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;
