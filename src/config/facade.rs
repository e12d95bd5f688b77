//! ConfigLoader facade delegating to merge service.

use super::merge::service::MergeService;
use super::SyncConfig;
use crate::error::SyncError;
use std::path::Path;

/// Configuration loader facade.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration for a sync root.
    pub fn load(sync_root: &Path) -> Result<SyncConfig, SyncError> {
        let config = MergeService::load(sync_root).map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<SyncConfig, SyncError> {
        let config = MergeService::load_from_file(path).map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Create default configuration.
    pub fn default() -> SyncConfig {
        SyncConfig::default()
    }
}

fn config_error(e: config::ConfigError) -> SyncError {
    SyncError::ConfigError(e.to_string())
}
