//! Configuration management for the vault
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (vault.toml)
//! - Environment variables (VAULT__*)
//!
//! ## Example config file (vault.toml):
//! ```toml
//! [storage]
//! path = "./vault"
//! default_author = "ana"
//!
//! [index]
//! lock_timeout_ms = 30000
//! persist = true
//!
//! [drafts]
//! abandon_after_hours = 72
//!
//! [release]
//! default_channel = "prod"
//! bot_author = "vault-bot"
//! ```

use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Main configuration for the vault
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub drafts: DraftConfig,

    #[serde(default)]
    pub release: ReleaseConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the store
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Author recorded when a caller supplies none
    #[serde(default)]
    pub default_author: Option<String>,
}

/// Search index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// How long index operations wait for the lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Keep `index.json` next to the store
    #[serde(default = "default_true")]
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftConfig {
    /// Drafts untouched this long are collected by `gc`
    #[serde(default = "default_abandon_after_hours")]
    pub abandon_after_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    #[serde(default = "default_channel")]
    pub default_channel: String,

    /// Author of automated commits such as rollbacks
    #[serde(default = "default_bot_author")]
    pub bot_author: String,
}

// Default value functions
fn default_storage_path() -> PathBuf {
    PathBuf::from("./vault")
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_abandon_after_hours() -> u64 {
    72
}

fn default_channel() -> String {
    "prod".to_string()
}

fn default_bot_author() -> String {
    "vault-bot".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            default_author: None,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            persist: true,
        }
    }
}

impl Default for DraftConfig {
    fn default() -> Self {
        Self {
            abandon_after_hours: default_abandon_after_hours(),
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            default_channel: default_channel(),
            bot_author: default_bot_author(),
        }
    }
}

impl VaultConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, adding a specific file on top of the defaults
    pub fn load_from(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        for location in ["vault.toml", ".vault.toml", "config/vault.toml"] {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(dirs) = directories::ProjectDirs::from("dev", "prompt-vault", "vault") {
            let xdg_config = dirs.config_dir().join("vault.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("VAULT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Config rooted at `path` with everything else defaulted
    pub fn at(path: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.storage.path = path.as_ref().to_path_buf();
        config
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the storage path (resolves relative paths)
    pub fn storage_path(&self) -> PathBuf {
        if self.storage.path.is_absolute() {
            self.storage.path.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.storage.path)
        }
    }

    /// Where the persisted index lives, if enabled
    pub fn index_file(&self) -> Option<PathBuf> {
        self.index
            .persist
            .then(|| self.storage_path().join("index.json"))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.index.lock_timeout_ms)
    }

    pub fn abandon_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.drafts.abandon_after_hours as i64)
    }

    /// Explicit author, else the configured default, else the bot
    pub fn author_or_default(&self, author: Option<&str>) -> String {
        author
            .map(str::to_string)
            .or_else(|| self.storage.default_author.clone())
            .unwrap_or_else(|| self.release.bot_author.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert_eq!(config.index.lock_timeout_ms, 30_000);
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.release.default_channel, "prod");
        assert_eq!(config.drafts.abandon_after_hours, 72);
    }

    #[test]
    fn test_serialize_config() {
        let config = VaultConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[index]"));
        assert!(toml_str.contains("[release]"));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(
            &file,
            "[storage]\npath = \"/srv/vault\"\n\n[index]\nlock_timeout_ms = 250\npersist = false\n",
        )
        .unwrap();

        let config = VaultConfig::load_from(file.to_str()).unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/srv/vault"));
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert!(config.index_file().is_none());
        assert_eq!(config.release.bot_author, "vault-bot");
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("vault.toml");
        let mut config = VaultConfig::at("/tmp/v");
        config.storage.default_author = Some("ana".to_string());
        config.save(&file).unwrap();

        let loaded = VaultConfig::load_from(file.to_str()).unwrap();
        assert_eq!(loaded.storage.default_author.as_deref(), Some("ana"));
        assert_eq!(loaded.author_or_default(None), "ana");
        assert_eq!(loaded.author_or_default(Some("ben")), "ben");
    }
}
