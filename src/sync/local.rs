//! Local-directory backend (USB drive, NAS mount, any mounted folder).
//!
//! Remote paths map onto files under the target directory.

use crate::error::ConfigError;
use crate::progress::percent;
use crate::sync::provider::{RemoteEntry, StorageProvider};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const COPY_BUFFER: usize = 256 * 1024;

/// Settings of the local-directory backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalParams {
    /// Target directory (USB drive, NAS mount, backup folder)
    pub path: PathBuf,
}

impl LocalParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingCredential {
                provider: "local",
                field: "path",
            });
        }
        Ok(())
    }
}

/// Local file system provider.
/// Mirrors remote paths under another local directory.
pub struct LocalProvider {
    target_path: PathBuf,
}

impl LocalProvider {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
        }
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        rel.split('/')
            .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
            .fold(self.target_path.clone(), |p, seg| p.join(seg))
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        Ok(())
    }
}

impl StorageProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn read_text(&self, rel: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.resolve(rel)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Cannot read {}", rel)),
        }
    }

    fn write_text(&self, rel: &str, text: &str) -> Result<()> {
        let path = self.resolve(rel);
        Self::ensure_parent(&path)?;
        fs::write(&path, text).with_context(|| format!("Cannot write {}", path.display()))
    }

    fn upload_file(
        &self,
        rel: &str,
        local: &Path,
        size_hint: u64,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let dst = self.resolve(rel);
        Self::ensure_parent(&dst)?;
        on_progress(0);

        let mut src =
            File::open(local).with_context(|| format!("Cannot open {}", local.display()))?;
        let mut out =
            File::create(&dst).with_context(|| format!("Cannot create {}", dst.display()))?;
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut written = 0u64;

        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            written += n as u64;
            on_progress(percent(written, size_hint).min(99));
        }
        out.flush()?;

        on_progress(100);
        debug!("[Local] Copied {} to {:?}", rel, dst);
        Ok(())
    }

    fn download_file(&self, rel: &str, local: &Path) -> Result<()> {
        Self::ensure_parent(local)?;
        fs::copy(self.resolve(rel), local)
            .with_context(|| format!("Cannot copy {} to {}", rel, local.display()))?;
        Ok(())
    }

    fn delete_file(&self, rel: &str) -> Result<()> {
        match fs::remove_file(self.resolve(rel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Cannot delete {}", rel)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.resolve(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        info!("[Local] Listing {:?}", dir);
        let mut entries = Vec::new();
        for entry in WalkDir::new(&dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.target_path) else {
                continue;
            };
            let filename: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            entries.push(RemoteEntry::file(filename.join("/"), entry.metadata()?.len()));
        }
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }
}
