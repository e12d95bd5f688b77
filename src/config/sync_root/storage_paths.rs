//! StorageConfig and resolve_paths for the sync database.

use crate::config::xdg;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sync database directory; relative paths resolve against the sync root.
    /// Unset means the per-root XDG data directory.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the sync database location for a root
    pub fn resolve_db_path(&self, sync_root: &Path) -> Result<PathBuf, SyncError> {
        match &self.db_path {
            Some(path) if path.is_absolute() => Ok(path.clone()),
            Some(path) => Ok(sync_root.join(path)),
            None => Ok(xdg::root_data_dir(sync_root)?.join("sync.db")),
        }
    }
}
