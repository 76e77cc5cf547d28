pub mod model;
pub mod nickname;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub use model::{ClientConfig, ConnectionConfig, IdentityConfig, LoggingConfig, OptionsConfig};

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tmiclient")
        .join("config.toml")
}

/// Load the user's config file, or defaults if there is none.
pub fn load_config() -> Result<ClientConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(ClientConfig::default());
    }
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: ClientConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
