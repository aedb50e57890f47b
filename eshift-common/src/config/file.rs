//! TOML configuration file support.
//!
//! Settings live under a `[migration]` table. Unknown keys are ignored so
//! newer files keep loading on older binaries.

use super::migration::ConfigPatch;
use crate::errors::{ErrorCode, MigrationError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    migration: ConfigPatch,
}

/// Default configuration file location (`<config_dir>/eshift/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("eshift").join("config.toml"))
}

/// Parse a configuration document.
pub fn parse_config(contents: &str) -> Result<ConfigPatch, MigrationError> {
    let file: ConfigFile = toml::from_str(contents).map_err(|e| MigrationError::Migration {
        code: ErrorCode::ConfigFileError,
        message: format!("invalid config file: {e}"),
    })?;
    Ok(file.migration)
}

/// Load a configuration file. A missing file yields an empty patch.
pub fn load_config_file(path: &Path) -> Result<ConfigPatch, MigrationError> {
    if !path.exists() {
        debug!("No config file at {:?}; using defaults", path);
        return Ok(ConfigPatch::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| MigrationError::Migration {
        code: ErrorCode::ConfigFileError,
        message: format!("failed to read {}: {e}", path.display()),
    })?;
    let patch = parse_config(&contents)?;
    debug!("Loaded config file {:?}", path);
    Ok(patch)
}
