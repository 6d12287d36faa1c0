use thiserror::Error;

/// Errors originating from tile addressing and plane mapping.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid max iterations: {0} (must be >= 1)")]
    InvalidMaxIterations(u32),

    #[error("invalid zoom level: {level} (must be <= {max})")]
    InvalidZoomLevel { level: u32, max: u32 },

    #[error("tile coordinate {axis}={value} does not fit the 15-bit key range")]
    CoordinateOutOfRange { axis: char, value: i32 },

    #[error("invalid plane mapping: {reason}")]
    InvalidPlaneMapping { reason: String },
}
