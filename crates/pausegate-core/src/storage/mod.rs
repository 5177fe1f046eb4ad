mod config;
pub mod store;

pub use config::{
    EngineConfig, QuickTaskConfig, QuotaConfig, SurfaceConfig, TimingConfig,
};
pub use store::{PersistedAppRecord, Store};

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns `~/.config/pausegate[-dev]/` based on PAUSEGATE_ENV.
///
/// Set PAUSEGATE_ENV=dev to use the development data directory.
///
/// # Errors
/// Returns an error if the config directory cannot be created.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("PAUSEGATE_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("pausegate-dev")
    } else {
        base_dir.join("pausegate")
    };

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::LoadFailed {
        path: dir.clone(),
        message: e.to_string(),
    })?;
    Ok(dir)
}
