//! StorageProvider trait - Abstraction over remote backends.
//!
//! Paths are POSIX-style and relative to the backend's configured root
//! (bucket prefix, app folder, WebDAV root or local directory).

use crate::sync::ProviderParams;
use anyhow::Result;
use std::path::Path;

/// A file found by [`StorageProvider::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Path relative to the provider root
    pub filename: String,
    /// Last path segment
    pub basename: String,
    /// Always false: listings contain files only
    pub is_directory: bool,
    /// Size in bytes (0 when the backend does not report it)
    pub size: u64,
}

impl RemoteEntry {
    pub fn file(filename: impl Into<String>, size: u64) -> Self {
        let filename = filename.into();
        let basename = filename
            .rsplit('/')
            .next()
            .unwrap_or(filename.as_str())
            .to_string();
        Self {
            filename,
            basename,
            is_directory: false,
            size,
        }
    }
}

/// Trait for all storage backends.
///
/// Not-found is never an error: `read_text` returns `None`, `delete_file`
/// succeeds and `list` returns an empty vector.
pub trait StorageProvider: Send + Sync {
    /// Provider name (s3, dropbox, webdav, local)
    fn name(&self) -> &'static str;

    /// Read a small text file. `None` when it does not exist.
    fn read_text(&self, rel: &str) -> Result<Option<String>>;

    /// Write a small text file, creating parents and overwriting.
    fn write_text(&self, rel: &str, text: &str) -> Result<()>;

    /// Stream a local file to `rel`.
    ///
    /// `on_progress` receives a percentage (0-100), at least once at the start and
    /// once at completion.
    fn upload_file(
        &self,
        rel: &str,
        local: &Path,
        size_hint: u64,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<()>;

    /// Download `rel` onto `local`, creating parent directories and overwriting.
    fn download_file(&self, rel: &str, local: &Path) -> Result<()>;

    /// Delete `rel`. Missing files count as deleted.
    fn delete_file(&self, rel: &str) -> Result<()>;

    /// List files under `prefix` recursively.
    fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>>;

    /// Credentials changed during use (e.g. a refreshed OAuth token) that the
    /// caller should persist.
    fn refreshed_params(&self) -> Option<ProviderParams> {
        None
    }
}

/// Join a root and a relative path into a POSIX path without duplicate slashes.
pub fn join_remote(root: &str, rel: &str) -> String {
    let root = root.trim_matches('/');
    let rel = rel.trim_matches('/');
    match (root.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (false, true) => root.to_string(),
        (false, false) => format!("{}/{}", root, rel),
    }
}
