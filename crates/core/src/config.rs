//! Configuration for the patch engine
//!
//! A single TOML file next to the host executable controls the optional
//! features. Loading creates the default file when missing, so a fresh
//! deployment works without manual setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config to TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Could not determine config directory from the host executable path
    #[error("Config directory not available - could not resolve host executable path")]
    NoConfigDirectory,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Engine configuration.
///
/// Loaded from `<game dir>/tamperveil/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Config version for future migration support
    pub version: u32,

    /// Redirect archive loads into the `pak_mods` directory
    pub load_pak_directory: bool,

    /// Anti-debug watcher poll interval in milliseconds
    pub watcher_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            load_pak_directory: true,
            watcher_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Load config from file, creating default if missing.
    pub fn load() -> ConfigResult<Self> {
        let path = config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Self = toml::from_str(&content)?;
            tracing::debug!("Loaded engine config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save()?;
            tracing::info!("Created default engine config at {:?}", path);
            Ok(default)
        }
    }

    /// Save config to file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save(&self) -> ConfigResult<()> {
        let path = config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        tracing::debug!("Saved engine config to {:?}", path);
        Ok(())
    }

    /// Reload config from file.
    pub fn reload(&mut self) -> ConfigResult<()> {
        let path = config_path()?;
        let content = std::fs::read_to_string(&path)?;
        *self = toml::from_str(&content)?;
        tracing::debug!("Reloaded engine config from {:?}", path);
        Ok(())
    }
}

/// Returns the directory the host executable runs from.
///
/// The engine is injected, so `current_exe` is the game binary; mods and
/// config live beside it.
pub fn game_root_dir() -> ConfigResult<PathBuf> {
    let exe = std::env::current_exe().map_err(ConfigError::IoError)?;
    exe.parent()
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Returns the engine's own directory: `<game dir>/tamperveil/`
pub fn engine_dir() -> ConfigResult<PathBuf> {
    Ok(game_root_dir()?.join("tamperveil"))
}

/// Returns the config file path: `<game dir>/tamperveil/config.toml`
pub fn config_path() -> ConfigResult<PathBuf> {
    Ok(engine_dir()?.join("config.toml"))
}

/// Returns the archive override directory: `<game dir>/pak_mods/`
pub fn pak_mods_dir() -> ConfigResult<PathBuf> {
    Ok(game_root_dir()?.join("pak_mods"))
}
