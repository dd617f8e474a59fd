//! Configuration file locations
//!
//! Handles finding configuration files and expanding user paths.

use std::path::{Path, PathBuf};

/// Configuration file locations (in order of precedence)
pub const CONFIG_LOCATIONS: &[&str] = &[
    "./suite-conductor.yaml",
    "./suite-conductor.yml",
    "./suite-conductor.json",
    "./.suite-conductor/config.yaml",
    "~/.config/suite-conductor/config.yaml",
];

/// Find configuration file in standard locations
pub(crate) fn find() -> Option<PathBuf> {
    CONFIG_LOCATIONS
        .iter()
        .map(|location| expand_path(location))
        .find(|path| path.exists())
}

/// Expand `~` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub(crate) fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
