//! CLI configuration file.
//!
//! `config.json` under the platform config directory. Every field is
//! optional; command-line flags take precedence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use credvault_vault::VaultOptions;

const APP_DIR: &str = "credvault";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Vault database location.
    pub store_path: Option<PathBuf>,
    /// PBKDF2 iterations for new headers.
    pub iterations: Option<u32>,
}

impl CliConfig {
    /// Platform location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join("config.json"))
    }

    /// Load from the platform location; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Resolve the store path: flag, then file, then the platform data dir.
    pub fn store_path(&self, flag: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = flag.or_else(|| self.store_path.clone()) {
            return Ok(path);
        }
        dirs::data_dir()
            .map(|d| d.join(APP_DIR).join("vault.db"))
            .context("No data directory on this platform; pass --store")
    }

    /// Resolve vault options: flag, then file, then defaults.
    pub fn options(&self, flag: Option<u32>) -> Result<VaultOptions> {
        let options = match flag.or(self.iterations) {
            Some(iterations) => VaultOptions::with_iterations(iterations),
            None => VaultOptions::default(),
        };
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_flags_override_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"store_path": "/tmp/a.db", "iterations": 5000}"#).unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.store_path(None).unwrap(), PathBuf::from("/tmp/a.db"));
        assert_eq!(
            config.store_path(Some(PathBuf::from("/tmp/b.db"))).unwrap(),
            PathBuf::from("/tmp/b.db")
        );
        assert_eq!(config.options(None).unwrap().iterations, 5000);
        assert_eq!(config.options(Some(7000)).unwrap().iterations, 7000);
    }

    #[test]
    fn test_invalid_iterations_rejected() {
        let config = CliConfig {
            iterations: Some(0),
            ..CliConfig::default()
        };
        assert!(config.options(None).is_err());
    }
}
