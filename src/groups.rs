//! Backup groups - static table of what each group protects.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Namespace of files declared by static groups.
pub const DATA_NAMESPACE: &str = "data";

/// Namespace of files discovered under emulator directories.
pub const EXTERNAL_NAMESPACE: &str = "external";

/// File name of the live library database.
pub const DATABASE_FILE: &str = "library.db";

/// Structured config file that gets a semantic hash.
pub const SEMANTIC_CONFIG_PATH: &str = "data/config.yml";

/// Manifest path of the database (snapshot on the remote side).
pub const DATABASE_PATH: &str = "data/library.db";

/// A selectable backup group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackupGroup {
    #[serde(rename = "config")]
    Config,
    #[serde(rename = "database")]
    Database,
    /// Emulator record stores (save data)
    #[serde(rename = "rms")]
    Rms,
    /// Emulator configuration directories
    #[serde(rename = "emuConfig")]
    EmuConfig,
}

impl BackupGroup {
    /// All groups in table order.
    pub const ALL: [BackupGroup; 4] = [
        BackupGroup::Config,
        BackupGroup::Database,
        BackupGroup::Rms,
        BackupGroup::EmuConfig,
    ];

    /// Group key as used in metadata and on the command line.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Database => "database",
            Self::Rms => "rms",
            Self::EmuConfig => "emuConfig",
        }
    }

    /// Declared paths relative to the data root. Dynamic groups declare none.
    pub fn static_paths(&self) -> &'static [&'static str] {
        match self {
            Self::Config => &["config.yml", "keybindings.json"],
            Self::Database => &["library.db", "library.db-wal", "library.db-shm"],
            Self::Rms | Self::EmuConfig => &[],
        }
    }

    /// Whether files are discovered by walking emulator directories.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Rms | Self::EmuConfig)
    }
}

impl fmt::Display for BackupGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for BackupGroup {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.key().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::UnknownGroup(s.to_string()))
    }
}

/// Manifest path of a static declared path.
pub fn data_rel(declared: &str) -> String {
    format!("{}/{}", DATA_NAMESPACE, declared)
}

/// Manifest paths of the live database trio.
pub fn database_trio_rels() -> Vec<String> {
    BackupGroup::Database
        .static_paths()
        .iter()
        .map(|p| data_rel(p))
        .collect()
}

/// Group a manifest path belongs to, if any.
pub fn group_of(rel: &str) -> Option<BackupGroup> {
    if let Some(declared) = rel
        .strip_prefix(DATA_NAMESPACE)
        .and_then(|r| r.strip_prefix('/'))
    {
        return BackupGroup::ALL
            .into_iter()
            .find(|g| g.static_paths().contains(&declared));
    }

    let rest = rel
        .strip_prefix(EXTERNAL_NAMESPACE)
        .and_then(|r| r.strip_prefix('/'))?;
    let mut parts = rest.splitn(3, '/');
    let (_emulator, kind, file) = (parts.next()?, parts.next()?, parts.next()?);
    if file.is_empty() {
        return None;
    }
    match kind {
        "rms" => Some(BackupGroup::Rms),
        "config" => Some(BackupGroup::EmuConfig),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_keys() {
        assert_eq!("emuConfig".parse::<BackupGroup>(), Ok(BackupGroup::EmuConfig));
        assert_eq!("RMS".parse::<BackupGroup>(), Ok(BackupGroup::Rms));
        assert_eq!(
            "saves".parse::<BackupGroup>(),
            Err(ConfigError::UnknownGroup("saves".to_string()))
        );
    }

    #[test]
    fn test_dynamic_groups_have_no_static_paths() {
        for group in BackupGroup::ALL {
            assert_eq!(group.is_dynamic(), group.static_paths().is_empty());
        }
    }

    #[test]
    fn test_database_trio() {
        assert_eq!(
            database_trio_rels(),
            vec!["data/library.db", "data/library.db-wal", "data/library.db-shm"]
        );
        assert_eq!(data_rel(DATABASE_FILE), DATABASE_PATH);
    }

    #[test]
    fn test_group_of() {
        assert_eq!(group_of("data/config.yml"), Some(BackupGroup::Config));
        assert_eq!(group_of("data/library.db"), Some(BackupGroup::Database));
        assert_eq!(group_of("external/kemu/rms/a/b.rms"), Some(BackupGroup::Rms));
        assert_eq!(group_of("external/kemu/config/keys.cfg"), Some(BackupGroup::EmuConfig));
        assert_eq!(group_of("external/kemu/rms"), None);
        assert_eq!(group_of("data/unknown.txt"), None);
        assert_eq!(group_of("index.tsv"), None);
    }
}
