//! MergeService: orchestrates sources, applies merge policy, deserializes to SyncConfig.

use crate::config::sources::{environment, global_file, root_file};
use crate::config::SyncConfig;
use config::{ConfigError, File, FileFormat};
use std::path::Path;
use tracing::debug;

use super::merge_policy;

/// Merge service for config composition.
pub struct MergeService;

impl MergeService {
    /// Load config for a sync root from the standard sources.
    /// Precedence: defaults (lowest) -> global file -> root file -> environment (highest).
    pub fn load(sync_root: &Path) -> Result<SyncConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = root_file::add_to_builder(builder, sync_root)?;
        let builder = environment::add_to_builder(builder)?;

        let mut config: SyncConfig = builder.build()?.try_deserialize()?;
        if config.sync.root.is_none() {
            config.sync.root = Some(sync_root.to_path_buf());
        }
        debug!(root = %sync_root.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load config from a specific file with environment overlay.
    pub fn load_from_file(path: &Path) -> Result<SyncConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        let builder = environment::add_to_builder(builder)?;

        builder.build()?.try_deserialize()
    }

    /// Parse an in-memory TOML document over the defaults, without environment overlay.
    pub fn load_from_str(contents: &str) -> Result<SyncConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = builder.add_source(File::from_str(contents, FileFormat::Toml));
        builder.build()?.try_deserialize()
    }
}
