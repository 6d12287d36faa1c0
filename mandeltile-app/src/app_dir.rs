//! Directories the CLI reads from and writes to.
//!
//! Everything lives next to the executable so a copied build carries its
//! preferences and exports with it.

use std::path::{Path, PathBuf};

/// Directory containing the running executable. Falls back to the current
/// working directory, then `"."`.
pub fn exe_directory() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default output directory for exported PNGs: `<exe_dir>/images`.
pub fn images_directory() -> PathBuf {
    exe_directory().join("images")
}

/// Resolve the export directory from preferences. Empty means the default;
/// relative paths are taken from the executable's directory.
pub fn resolve_export_dir(configured: &str) -> PathBuf {
    if configured.is_empty() {
        return images_directory();
    }
    let path = PathBuf::from(configured);
    if path.is_absolute() {
        path
    } else {
        exe_directory().join(path)
    }
}
