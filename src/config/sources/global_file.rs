//! Global config file: `$XDG_CONFIG_HOME/syncore/config.toml`

use crate::config::xdg;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File, FileFormat};
use std::path::PathBuf;

/// Location of the global config file, if a home directory is known
pub fn path() -> Option<PathBuf> {
    xdg::config_home()
        .ok()
        .map(|home| home.join(xdg::APP_DIR).join("config.toml"))
}

/// Add the global file to builder when it exists.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    match path() {
        Some(path) if path.exists() => Ok(builder.add_source(
            File::from(path).format(FileFormat::Toml).required(false),
        )),
        _ => Ok(builder),
    }
}
