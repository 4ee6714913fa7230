//! Manifest diff - What a backup run has to upload and delete.

use crate::manifest::{index_by_path, IndexRow};
use std::collections::HashSet;

/// Result of comparing the local index against the remote manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Paths to upload, sorted
    pub upload: Vec<String>,
    /// Remote paths to delete, sorted (full mode only)
    pub delete: Vec<String>,
}

/// Compare `local` rows with `remote` rows.
///
/// Full mode uploads every local path and deletes remote paths missing locally.
/// Incremental mode uploads new or changed paths and never deletes.
pub fn diff(full_mode: bool, local: &[IndexRow], remote: &[IndexRow]) -> DiffResult {
    let remote_by_path = index_by_path(remote);

    let mut upload: Vec<String> = local
        .iter()
        .filter(|row| {
            full_mode
                || remote_by_path
                    .get(row.path.as_str())
                    .map_or(true, |r| r.md5 != row.md5)
        })
        .map(|row| row.path.clone())
        .collect();
    upload.sort();
    upload.dedup();

    let mut delete = Vec::new();
    if full_mode {
        let local_paths: HashSet<&str> = local.iter().map(|r| r.path.as_str()).collect();
        delete = remote
            .iter()
            .filter(|r| !local_paths.contains(r.path.as_str()))
            .map(|r| r.path.clone())
            .collect();
        delete.sort();
        delete.dedup();
    }

    DiffResult { upload, delete }
}
