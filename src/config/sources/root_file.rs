//! Per-root config file: `<sync root>/.syncore.toml`

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File, FileFormat};
use std::path::{Path, PathBuf};

/// Name of the per-root override file
pub const ROOT_CONFIG_FILE: &str = ".syncore.toml";

pub fn path(sync_root: &Path) -> PathBuf {
    sync_root.join(ROOT_CONFIG_FILE)
}

/// Add the sync-root file to builder when it exists.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    sync_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let path = path(sync_root);
    if !path.exists() {
        return Ok(builder);
    }
    Ok(builder.add_source(File::from(path).format(FileFormat::Toml).required(false)))
}
