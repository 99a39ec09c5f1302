//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::DEFAULT_MAX_STORAGE_BYTES;
use crate::{Error, Result};

pub const DEFAULT_BASE_PORT: u16 = 4400;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Host the server binds and clients dial.
    pub host: String,
    /// Control bus port; the data plane uses the next port up.
    pub base_port: u16,
    /// Slice storage budget in bytes.
    pub storage_budget_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: DEFAULT_BASE_PORT,
            storage_budget_bytes: DEFAULT_MAX_STORAGE_BYTES,
        }
    }
}

impl Config {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.base_port)
    }

    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.host, self.base_port + 1)
    }
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SCOPEWIRE_CONFIG_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        })
        .join("scopewire")
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))
}

/// Loads the user config, falling back to defaults and writing them out
/// on first run so the file exists to edit.
pub fn load_or_init() -> Config {
    let path = config_path();
    if path.exists() {
        match load(&path) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let config = Config::default();
    if let Err(e) = write_config(&path, &config) {
        tracing::warn!("failed to write default config: {e}");
    }
    config
}

pub fn write_config(path: &Path, config: &Config) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| config_error("config path missing parent directory".to_string()))?;
    fs::create_dir_all(dir)
        .map_err(|e| config_error(format!("failed to create {}: {e}", dir.display())))?;

    let contents = toml::to_string_pretty(config)
        .map_err(|e| config_error(format!("failed to render config: {e}")))?;

    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        config_error(format!(
            "failed to create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    fs::write(temp.path(), contents.as_bytes())
        .map_err(|e| config_error(format!("failed to write config temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        config_error(format!(
            "failed to persist config to {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn config_error(reason: String) -> Error {
    Error::Config(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config {
            host: "10.0.0.5".to_string(),
            base_port: 5100,
            storage_budget_bytes: 1 << 20,
        };
        write_config(&path, &config).unwrap();
        assert_eq!(load(&path).unwrap(), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = toml::from_str("base_port = 9000").unwrap();
        assert_eq!(config.base_port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.storage_budget_bytes, DEFAULT_MAX_STORAGE_BYTES);
    }

    #[test]
    fn derived_addrs_use_adjacent_ports() {
        let config = Config::default();
        assert_eq!(config.control_addr(), "127.0.0.1:4400");
        assert_eq!(config.data_addr(), "127.0.0.1:4401");
    }
}
