use thiserror::Error;

/// Errors originating from the tile pipeline.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The allocator refused a new tile image. Recoverable by evicting
    /// tiles and retrying.
    #[error("tile image allocation failed ({live} of {capacity} images live)")]
    AllocationFailed { live: usize, capacity: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid image dimensions: {width}×{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("unsupported snapshot version {found} (expected {expected})")]
    SnapshotVersion { found: u32, expected: u32 },

    #[error("snapshot tile size {found} does not match {expected}")]
    SnapshotTileSize { found: u32, expected: u32 },

    #[error("malformed snapshot payload: {0}")]
    SnapshotPayload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("PNG encoding failed: {0}")]
    Png(#[from] png::EncodingError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] mandeltile_core::CoreError),
}

impl RenderError {
    /// True for failures that eviction can cure.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }
}
