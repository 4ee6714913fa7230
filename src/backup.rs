//! Backup orchestrator - Resolve, snapshot, hash, diff, transfer, write manifest.
//!
//! Per-file failures never abort a run: they are logged, reported as
//! [`ProgressEvent::Error`] and counted in the summary.

use crate::context::LocalContext;
use crate::diff::diff;
use crate::groups::{database_trio_rels, group_of, BackupGroup, DATABASE_PATH};
use crate::hashing::build_local_index;
use crate::manifest::{
    index_by_path, parse_index, serialize_index, BackupMeta, BackupMode, IndexRow, MetaCounts,
    INDEX_FILE, META_FILE,
};
use crate::progress::{CountingSink, ProgressEvent, ProgressSink, Stage};
use crate::resolver::{resolve_items, BackupItem};
use crate::sync::StorageProvider;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{info, warn};

/// Options for a backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub mode: BackupMode,
    /// Groups to back up (default: all)
    pub groups: Vec<BackupGroup>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            mode: BackupMode::Incremental,
            groups: BackupGroup::ALL.to_vec(),
        }
    }
}

/// Result of a backup run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupSummary {
    /// Files uploaded
    pub uploaded: usize,
    /// Remote files deleted (full mode)
    pub deleted: usize,
    /// Files in the local index
    pub total_local: usize,
    /// Error events emitted during the run
    pub failures: usize,
    /// Metadata written to the remote, if the write succeeded
    pub meta: Option<BackupMeta>,
}

/// Database snapshot side file, removed when dropped.
struct SnapshotFile(PathBuf);

impl SnapshotFile {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("savesync-{}.db", uuid::Uuid::new_v4())))
    }
}

impl Drop for SnapshotFile {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = std::fs::remove_file(&self.0) {
                warn!("[Backup] Cannot remove snapshot {}: {}", self.0.display(), e);
            }
        }
    }
}

/// Replace the live database trio with a snapshot item.
///
/// Returns `true` when a live database exists but no snapshot made it into
/// `items`; its remote copy must then be left alone.
fn substitute_snapshot(
    items: &mut Vec<BackupItem>,
    ctx: &LocalContext,
    snapshot: &SnapshotFile,
    sink: &CountingSink,
) -> bool {
    let trio: HashSet<String> = database_trio_rels().into_iter().collect();
    let had_live = items.iter().any(|i| i.rel == DATABASE_PATH);
    items.retain(|i| !trio.contains(&i.rel));

    if !had_live && !ctx.database_path().exists() {
        return false;
    }
    let Some(db) = ctx.database else {
        warn!("[Backup] No database handle, skipping library database");
        return true;
    };

    let result = db
        .snapshot_to(&snapshot.0)
        .and_then(|()| BackupItem::from_path(DATABASE_PATH, &snapshot.0));
    match result {
        Ok(item) => {
            info!("[Backup] Database snapshot taken ({} bytes)", item.size);
            items.push(item);
            items.sort_by(|a, b| a.rel.cmp(&b.rel));
            false
        }
        Err(e) => {
            sink.error(DATABASE_PATH, Stage::Snapshot, &e);
            true
        }
    }
}

/// Read the remote manifest; absent means empty.
pub fn read_remote_index(provider: &dyn StorageProvider) -> Result<Vec<IndexRow>> {
    Ok(provider
        .read_text(INDEX_FILE)
        .context("Cannot read remote manifest")?
        .map(|text| parse_index(&text))
        .unwrap_or_default())
}

/// Rows to publish: what the remote holds once the run is over.
///
/// Local rows win, except that a failed upload keeps the remote row (or no row
/// for a new file). Remote rows missing locally stay listed unless they were
/// deleted, so a later full run can still see and remove them.
fn manifest_rows(
    local: &[IndexRow],
    remote: &[IndexRow],
    failed_uploads: &HashSet<String>,
    deleted: &HashSet<String>,
) -> Vec<IndexRow> {
    let remote_by_path = index_by_path(remote);
    let local_paths: HashSet<&str> = local.iter().map(|r| r.path.as_str()).collect();
    let mut rows: Vec<IndexRow> = local
        .iter()
        .filter_map(|row| {
            if failed_uploads.contains(&row.path) {
                remote_by_path.get(row.path.as_str()).map(|r| (*r).clone())
            } else {
                Some(row.clone())
            }
        })
        .collect();
    rows.extend(
        remote
            .iter()
            .filter(|r| !local_paths.contains(r.path.as_str()) && !deleted.contains(&r.path))
            .cloned(),
    );
    rows.sort_by(|a, b| a.path.cmp(&b.path));
    rows.dedup_by(|a, b| a.path == b.path);
    rows
}

/// Whether a full run may delete `path`: it belongs to a selected group (or to
/// no known group) and was not held back by a local read failure.
fn deletable(path: &str, groups: &[BackupGroup], held: &HashSet<String>) -> bool {
    !held.contains(path) && group_of(path).map_or(true, |g| groups.contains(&g))
}

/// Run one backup against `provider`.
pub fn run_backup(
    provider: &dyn StorageProvider,
    options: &BackupOptions,
    ctx: &LocalContext,
    sink: &dyn ProgressSink,
) -> Result<BackupSummary> {
    let sink = CountingSink::new(sink, "Backup");
    let full_mode = options.mode == BackupMode::Full;
    info!(
        "[Backup] Starting {:?} backup of {:?} to {}",
        options.mode,
        options.groups,
        provider.name()
    );

    // 1-2. Resolve, substitute the database snapshot
    let mut items = resolve_items(&options.groups, ctx.data_root, ctx.emulators);
    let snapshot = SnapshotFile::new();
    let mut held = HashSet::new();
    if options.groups.contains(&BackupGroup::Database)
        && substitute_snapshot(&mut items, ctx, &snapshot, &sink)
    {
        held.insert(DATABASE_PATH.to_string());
    }

    // 3-5. Remote manifest, local index, diff
    let remote = read_remote_index(provider)?;
    let local = build_local_index(&items, None, &sink);
    let hashed: HashSet<&str> = local.iter().map(|r| r.path.as_str()).collect();
    held.extend(
        items
            .iter()
            .filter(|i| !hashed.contains(i.rel.as_str()))
            .map(|i| i.rel.clone()),
    );
    let mut plan = diff(full_mode, &local, &remote);
    plan.delete
        .retain(|path| deletable(path, &options.groups, &held));
    info!(
        "[Backup] {} local files, {} to upload, {} to delete",
        local.len(),
        plan.upload.len(),
        plan.delete.len()
    );

    // 6. Deletes (full mode only)
    let mut deleted = HashSet::new();
    for path in &plan.delete {
        match provider.delete_file(path) {
            Ok(()) => {
                deleted.insert(path.clone());
                sink.emit(ProgressEvent::Delete { path: path.clone() });
            }
            Err(e) => sink.error(path, Stage::Delete, &e),
        }
    }

    // 7. Uploads
    let by_rel: HashMap<&str, &BackupItem> = items.iter().map(|i| (i.rel.as_str(), i)).collect();
    let mut uploaded = 0;
    let mut failed_uploads = HashSet::new();
    for path in &plan.upload {
        let Some(item) = by_rel.get(path.as_str()) else {
            continue;
        };
        let mut on_progress = |percent: u8| {
            sink.emit(ProgressEvent::UploadProgress {
                path: path.clone(),
                percent,
            })
        };
        match provider.upload_file(path, &item.abs, item.size, &mut on_progress) {
            Ok(()) => {
                uploaded += 1;
                sink.emit(ProgressEvent::UploadDone { path: path.clone() });
            }
            Err(e) => {
                sink.error(path, Stage::Upload, &e);
                failed_uploads.insert(path.clone());
            }
        }
    }

    // 8. Manifest + metadata
    let rows = manifest_rows(&local, &remote, &failed_uploads, &deleted);
    let mut meta = None;
    match provider.write_text(INDEX_FILE, &serialize_index(&rows)) {
        Ok(()) => {
            let fresh = BackupMeta::new(
                options.mode,
                &options.groups,
                MetaCounts {
                    files: local.len(),
                    uploaded,
                    deleted: deleted.len(),
                },
            );
            match fresh
                .to_json()
                .and_then(|json| provider.write_text(META_FILE, &json))
            {
                Ok(()) => meta = Some(fresh),
                Err(e) => sink.error(META_FILE, Stage::Manifest, &e),
            }
        }
        Err(e) => sink.error(INDEX_FILE, Stage::Manifest, &e),
    }

    let summary = BackupSummary {
        uploaded,
        deleted: deleted.len(),
        total_local: local.len(),
        failures: sink.errors(),
        meta,
    };
    info!(
        "[Backup] Done: {} uploaded, {} deleted, {} failures",
        summary.uploaded, summary.deleted, summary.failures
    );
    Ok(summary)
}
