use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use mandeltile_render::ControllerConfig;

/// Persisted CLI preferences.
///
/// Stored as `preferences.json` next to the executable. Unknown or missing
/// fields fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppPreferences {
    #[serde(default = "default_view_width")]
    pub view_width: u32,
    #[serde(default = "default_view_height")]
    pub view_height: u32,
    /// Index into the interesting-places list used when no center is given.
    #[serde(default)]
    pub default_place: usize,
    /// Empty means `<exe_dir>/images`.
    #[serde(default)]
    pub export_dir: String,
    #[serde(default)]
    pub controller: ControllerConfig,
}

fn default_view_width() -> u32 {
    1024
}

fn default_view_height() -> u32 {
    768
}

impl Default for AppPreferences {
    fn default() -> Self {
        Self {
            view_width: default_view_width(),
            view_height: default_view_height(),
            default_place: 0,
            export_dir: String::new(),
            controller: ControllerConfig::default(),
        }
    }
}

impl AppPreferences {
    /// Load preferences from next to the executable, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            debug!("No preferences file at {}", path.display());
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<AppPreferences>(&json) {
                Ok(prefs) => {
                    info!("Loaded preferences from {}", path.display());
                    return prefs;
                }
                Err(e) => error!("Failed to parse preferences: {e}"),
            },
            Err(e) => error!("Failed to read preferences file: {e}"),
        }
        Self::default()
    }

    /// Persist preferences to disk.
    pub fn save(&self) {
        self.save_to(&config_path());
    }

    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory: {e}");
                return;
            }
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, &json) {
                    error!("Failed to write preferences: {e}");
                } else {
                    debug!("Saved preferences");
                }
            }
            Err(e) => error!("Failed to serialize preferences: {e}"),
        }
    }
}

pub fn config_path() -> PathBuf {
    crate::app_dir::exe_directory().join("preferences.json")
}
