//! XDG Base Directory utilities for per-root data.

use crate::error::SyncError;
use std::path::{Component, Path, PathBuf};

/// Application directory name under the XDG homes
pub const APP_DIR: &str = "syncore";

/// Get XDG data home directory
///
/// Returns `$XDG_DATA_HOME` if set, otherwise defaults to `$HOME/.local/share`
pub fn data_home() -> Option<PathBuf> {
    if let Ok(xdg_data_home) = std::env::var("XDG_DATA_HOME") {
        if !xdg_data_home.is_empty() {
            return Some(PathBuf::from(xdg_data_home));
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local").join("share"))
}

/// Get XDG config home directory
///
/// Returns `$XDG_CONFIG_HOME` if set, otherwise defaults to `$HOME/.config`
pub fn config_home() -> Result<PathBuf, SyncError> {
    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg_config_home.is_empty() {
            return Ok(PathBuf::from(xdg_config_home));
        }
    }

    let home = std::env::var("HOME").map_err(|_| {
        SyncError::ConfigError(
            "Could not determine XDG config home directory (HOME not set)".to_string(),
        )
    })?;

    Ok(PathBuf::from(home).join(".config"))
}

/// Get the data directory for one sync root
///
/// The canonical root path is mirrored below `$XDG_DATA_HOME/syncore/`, so
/// `/home/user/Drive` keeps its database in
/// `$XDG_DATA_HOME/syncore/home/user/Drive/`. Nothing is written inside the
/// synchronized tree itself.
pub fn root_data_dir(sync_root: &Path) -> Result<PathBuf, SyncError> {
    let data_home = data_home().ok_or_else(|| {
        SyncError::ConfigError(
            "Could not determine XDG data home directory (HOME not set)".to_string(),
        )
    })?;

    // dunce keeps Windows roots free of the \\?\ prefix
    let canonical = dunce::canonicalize(sync_root).map_err(|e| {
        SyncError::ConfigError(format!("Failed to canonicalize sync root: {}", e))
    })?;

    Ok(mirror_components(data_home.join(APP_DIR), &canonical))
}

fn mirror_components(mut base: PathBuf, path: &Path) -> PathBuf {
    for component in path.components() {
        if let Component::Normal(name) = component {
            base = base.join(name);
        }
    }
    base
}
