//! Credential store - `credentials.json` next to the config file.

use crate::config::default_config_dir;
use crate::sync::{ProviderKind, ProviderParams};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Provider params keyed by provider name.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    path: PathBuf,
    entries: BTreeMap<String, ProviderParams>,
}

/// Get default credentials file path.
pub fn default_credentials_path() -> PathBuf {
    default_config_dir().join("credentials.json")
}

impl CredentialStore {
    /// Load from `path`; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read credentials: {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Cannot parse credentials: {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&default_credentials_path())
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&ProviderParams> {
        self.entries.get(kind.name())
    }

    /// Insert or replace the params of their provider.
    pub fn put(&mut self, params: ProviderParams) {
        self.entries.insert(params.kind().name().to_string(), params);
    }

    /// Write the store (0600 on Unix).
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Cannot write credentials: {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{DropboxParams, LocalParams};
    use tempfile::TempDir;

    #[test]
    fn test_save_load_credentials_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let creds_path = temp_dir.path().join("credentials.json");

        let mut store = CredentialStore::load(&creds_path)?;
        assert!(store.get(ProviderKind::Dropbox).is_none());

        store.put(ProviderParams::Dropbox(DropboxParams::new("key", "a1", "r1")));
        store.put(ProviderParams::Local(LocalParams {
            path: temp_dir.path().join("mirror"),
        }));
        store.save()?;

        let loaded = CredentialStore::load(&creds_path)?;
        match loaded.get(ProviderKind::Dropbox) {
            Some(ProviderParams::Dropbox(p)) => assert_eq!(p.refresh_token, "r1"),
            other => panic!("unexpected entry: {:?}", other),
        }
        assert!(loaded.get(ProviderKind::Local).is_some());

        Ok(())
    }
}
