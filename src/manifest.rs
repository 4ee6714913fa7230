//! Manifest format - `index.tsv` rows and the `index.meta.json` document.
//!
//! The TSV manifest has an optional header `path\tmd5\tsize\tmtime` followed by one
//! row per file. Paths are always POSIX-separated.

use crate::groups::BackupGroup;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Remote manifest file name.
pub const INDEX_FILE: &str = "index.tsv";

/// Remote metadata file name.
pub const META_FILE: &str = "index.meta.json";

const HEADER: &str = "path\tmd5\tsize\tmtime";

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    /// Namespaced POSIX path (unique key)
    pub path: String,
    /// Hex MD5 (semantic hash for config.yml)
    pub md5: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time, milliseconds since epoch
    pub mtime: i64,
}

/// Parse `index.tsv` content.
///
/// Blank lines and the header are skipped. Malformed rows are logged and skipped
/// rather than failing the whole manifest.
pub fn parse_index(text: &str) -> Vec<IndexRow> {
    let mut rows = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line == HEADER {
            continue;
        }

        let mut fields = line.split('\t');
        let (Some(path), Some(md5), Some(size), Some(mtime)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            warn!("[Manifest] Skipping short row at line {}", line_no + 1);
            continue;
        };

        match (size.trim().parse::<u64>(), mtime.trim().parse::<i64>()) {
            (Ok(size), Ok(mtime)) if !path.is_empty() => rows.push(IndexRow {
                path: path.to_string(),
                md5: md5.trim().to_string(),
                size,
                mtime,
            }),
            _ => warn!("[Manifest] Skipping malformed row at line {}", line_no + 1),
        }
    }

    rows
}

/// Serialize rows to `index.tsv` content (with header).
pub fn serialize_index(rows: &[IndexRow]) -> String {
    let mut out = String::with_capacity(HEADER.len() + rows.len() * 64);
    out.push_str(HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            row.path, row.md5, row.size, row.mtime
        ));
    }
    out
}

/// Index rows keyed by path.
pub fn index_by_path(rows: &[IndexRow]) -> HashMap<&str, &IndexRow> {
    rows.iter().map(|r| (r.path.as_str(), r)).collect()
}

/// Backup mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Upload everything, delete remote files missing locally
    Full,
    /// Upload new/changed files only, never delete
    Incremental,
}

/// File counters of a backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaCounts {
    pub files: usize,
    pub uploaded: usize,
    pub deleted: usize,
}

/// Metadata written next to the manifest after every backup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    /// Random id of the run
    pub backup_id: String,
    /// Run timestamp
    pub created_at: DateTime<Utc>,
    pub mode: BackupMode,
    /// Group keys that were selected
    pub groups: Vec<BackupGroup>,
    pub counts: MetaCounts,
}

impl BackupMeta {
    /// Create metadata for a finished run.
    pub fn new(mode: BackupMode, groups: &[BackupGroup], counts: MetaCounts) -> Self {
        Self {
            backup_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            mode,
            groups: groups.to_vec(),
            counts,
        }
    }

    /// Parse `index.meta.json`.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse index.meta.json")
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize backup metadata")
    }
}
