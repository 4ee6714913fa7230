//! Config module - Manages SaveSync configuration (savesync.toml).
//!
//! Configuration file contains:
//! - Launcher data root and library database path
//! - Installed emulators (dynamic backup groups)
//! - Restore ignore patterns
//! - Active storage provider name (credentials live in `credentials.json`)

use crate::error::ConfigError;
use crate::groups::DATABASE_FILE;
use crate::resolver::{EmulatorInstall, EmulatorSource};
use crate::sync::ProviderKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main SaveSync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config version (for future migrations)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Launcher data directory (holds config.yml, keybindings.json, library.db)
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Library database, when it does not live in the data root
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Paths the restore planner ignores (exact, `prefix*` or directory prefix)
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Active storage provider (s3, dropbox, webdav, local)
    #[serde(default)]
    pub provider: Option<String>,

    /// Installed emulators
    #[serde(default)]
    pub emulators: Vec<EmulatorInstall>,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_root: default_data_root(),
            database_path: None,
            ignore_patterns: Vec::new(),
            provider: None,
            emulators: Vec::new(),
        }
    }
}

/// Get default launcher data root.
pub fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("savesync").join("data"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Get default config directory (~/.config/savesync/).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("savesync"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get default config file path.
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("savesync.toml")
}

impl Config {
    /// Create new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config with specific data root.
    pub fn with_data_root(data_root: PathBuf) -> Self {
        Self {
            data_root,
            ..Self::default()
        }
    }

    /// Load config from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Cannot parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from default path.
    pub fn load_default() -> Result<Self> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).with_context(|| "Cannot serialize config to TOML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Cannot write config file: {}", path.display()))?;

        // Restrict file permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Save config to default path.
    pub fn save_default(&self) -> Result<PathBuf> {
        let path = default_config_path();
        self.save(&path)?;
        Ok(path)
    }

    /// Check if a provider has been chosen.
    pub fn is_initialized(&self) -> bool {
        self.provider.is_some()
    }

    /// Live library database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_root.join(DATABASE_FILE))
    }

    /// Parsed provider name, `None` when not configured yet.
    pub fn provider_kind(&self) -> Result<Option<ProviderKind>, ConfigError> {
        self.provider.as_deref().map(str::parse).transpose()
    }
}

impl EmulatorSource for Config {
    fn emulators(&self) -> Vec<EmulatorInstall> {
        self.emulators.clone()
    }
}
