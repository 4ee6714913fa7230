//! Restore executor - Best-effort download of selected groups.

use super::ignore::PathMatcher;
use super::planner::local_database_state;
use super::LibraryRescan;
use crate::backup::read_remote_index;
use crate::context::LocalContext;
use crate::database::sidecar_paths;
use crate::groups::{data_rel, BackupGroup, DATABASE_PATH, EXTERNAL_NAMESPACE};
use crate::hashing::hash_item;
use crate::manifest::{index_by_path, IndexRow};
use crate::progress::{CountingSink, ProgressEvent, ProgressSink, Stage};
use crate::resolver::{candidate_roots, namespace_mappings, BackupItem};
use crate::sync::StorageProvider;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What to restore.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub groups: Vec<BackupGroup>,
    /// Download even when the local copy already matches
    pub force: bool,
    /// Only restore paths matching these patterns
    pub include_paths: Option<Vec<String>>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            groups: BackupGroup::ALL.to_vec(),
            force: false,
            include_paths: None,
        }
    }
}

/// Result of a restore run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub ok: bool,
    /// Files written locally (database included)
    pub restored: usize,
    pub db_restored: bool,
    /// Files left alone because they already matched
    pub skipped: usize,
    pub failures: usize,
}

enum Outcome {
    Restored,
    Unchanged,
}

struct Run<'a> {
    provider: &'a dyn StorageProvider,
    remote: HashMap<&'a str, &'a IndexRow>,
    include: Option<PathMatcher>,
    force: bool,
    sink: CountingSink<'a>,
    restored: usize,
    skipped: usize,
}

impl Run<'_> {
    fn selected(&self, rel: &str) -> bool {
        self.include.as_ref().map_or(true, |m| m.matches(rel))
    }

    fn record(&mut self, rel: &str, result: Result<Outcome>) {
        match result {
            Ok(Outcome::Restored) => {
                self.restored += 1;
                self.sink.emit(ProgressEvent::Restored {
                    path: rel.to_string(),
                });
            }
            Ok(Outcome::Unchanged) => {
                debug!("[Restore] {} unchanged, skipped", rel);
                self.skipped += 1;
            }
            Err(e) => self.sink.error(rel, Stage::Download, &e),
        }
    }

    /// Download one regular file unless it already matches the manifest.
    fn restore_file(&self, rel: &str, dest: &Path) -> Result<Outcome> {
        if !self.force && dest.is_file() {
            if let Some(row) = self.remote.get(rel) {
                let local = BackupItem::from_path(rel, dest).and_then(|item| hash_item(&item));
                if matches!(local, Ok(md5) if md5 == row.md5) {
                    return Ok(Outcome::Unchanged);
                }
            }
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        self.download_staged(rel, dest)?;
        Ok(Outcome::Restored)
    }

    /// Download next to `dest` and rename over it, so a broken transfer never
    /// touches the live file.
    fn download_staged(&self, rel: &str, dest: &Path) -> Result<()> {
        let mut staged = dest.as_os_str().to_owned();
        staged.push(".restore");
        let staged = PathBuf::from(staged);

        let result = self.provider.download_file(rel, &staged).and_then(|()| {
            std::fs::rename(&staged, dest)
                .with_context(|| format!("Cannot replace {}", dest.display()))
        });
        if result.is_err() && staged.exists() {
            if let Err(e) = std::fs::remove_file(&staged) {
                warn!("[Restore] Cannot remove {}: {}", staged.display(), e);
            }
        }
        result
    }

    /// Replace the live database with the remote snapshot.
    fn restore_database(&self, ctx: &LocalContext, row: &IndexRow) -> Result<Outcome> {
        let live = ctx.database_path();
        if !self.force && live.exists() {
            let state = local_database_state(&live)?;
            if state.md5.as_deref() == Some(row.md5.as_str()) {
                return Ok(Outcome::Unchanged);
            }
        }

        if let Some(db) = ctx.database {
            db.close()?;
        }
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent)?;
        }

        self.download_staged(DATABASE_PATH, &live)?;

        for sidecar in sidecar_paths(&live) {
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)
                    .with_context(|| format!("Cannot remove stale {}", sidecar.display()))?;
            }
        }
        info!("[Restore] Library database replaced");
        Ok(Outcome::Restored)
    }
}

/// Local destination of a declared static path.
///
/// The first candidate root whose parent directory already exists wins; the
/// primary root is used (and created) when none does.
fn static_destination(data_root: &Path, declared: &str) -> PathBuf {
    let (primary, roaming) = candidate_roots(data_root);
    let primary = primary.join(declared);
    let has_parent = |p: &Path| p.parent().is_some_and(Path::is_dir);

    if has_parent(&primary) {
        return primary;
    }
    match roaming.map(|r| r.join(declared)) {
        Some(roaming) if has_parent(&roaming) => roaming,
        _ => primary,
    }
}

/// Restore the selected groups from `provider`.
///
/// Per-file failures are reported to `sink` and do not stop the run. When the
/// database was replaced, `rescan` is asked to refresh the library.
pub fn execute_restore(
    provider: &dyn StorageProvider,
    options: &RestoreOptions,
    ctx: &LocalContext,
    rescan: Option<&dyn LibraryRescan>,
    sink: &dyn ProgressSink,
) -> Result<RestoreSummary> {
    let remote_rows = read_remote_index(provider)?;
    let mut run = Run {
        provider,
        remote: index_by_path(&remote_rows),
        include: options.include_paths.as_ref().map(PathMatcher::new),
        force: options.force,
        sink: CountingSink::new(sink, "Restore"),
        restored: 0,
        skipped: 0,
    };
    info!(
        "[Restore] Restoring {:?} from {} (force: {})",
        options.groups,
        provider.name(),
        options.force
    );

    // 1. Database
    let mut db_restored = false;
    if options.groups.contains(&BackupGroup::Database) && run.selected(DATABASE_PATH) {
        if let Some(row) = run.remote.get(DATABASE_PATH).copied() {
            let result = run.restore_database(ctx, row);
            db_restored = matches!(result, Ok(Outcome::Restored));
            run.record(DATABASE_PATH, result);
        }
    }

    // 2. Static groups
    for group in options
        .groups
        .iter()
        .filter(|g| !g.is_dynamic() && **g != BackupGroup::Database)
    {
        for declared in group.static_paths() {
            let rel = data_rel(declared);
            if !run.remote.contains_key(rel.as_str()) || !run.selected(&rel) {
                continue;
            }
            let dest = static_destination(ctx.data_root, declared);
            let result = run.restore_file(&rel, &dest);
            run.record(&rel, result);
        }
    }

    // 3. Dynamic groups, from the manifest
    let mappings = namespace_mappings(&options.groups, ctx.emulators);
    if !mappings.is_empty() {
        let mut paths: Vec<&str> = run
            .remote
            .keys()
            .copied()
            .filter(|p| p.starts_with(EXTERNAL_NAMESPACE))
            .collect();
        paths.sort_unstable();
        for rel in paths {
            let Some(dest) = mappings.iter().find_map(|m| m.local_path_for(rel)) else {
                continue;
            };
            if !run.selected(rel) {
                continue;
            }
            let result = run.restore_file(rel, &dest);
            run.record(rel, result);
        }
    }

    // 4. Rescan
    if db_restored {
        match rescan {
            Some(hook) => hook.request_rescan(),
            None => warn!("[Restore] Database restored but no rescan hook is installed"),
        }
    }

    let summary = RestoreSummary {
        ok: true,
        restored: run.restored,
        db_restored,
        skipped: run.skipped,
        failures: run.sink.errors(),
    };
    info!(
        "[Restore] Done: {} restored, {} unchanged, {} failures",
        summary.restored, summary.skipped, summary.failures
    );
    Ok(summary)
}
