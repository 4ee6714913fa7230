//! Restore planner - Decide whether restoring would clobber newer local work.

use super::ignore::PathMatcher;
use crate::backup::read_remote_index;
use crate::context::LocalContext;
use crate::database::sidecar_paths;
use crate::groups::{database_trio_rels, group_of, BackupGroup, DATABASE_PATH};
use crate::hashing::{build_local_index, md5_file};
use crate::manifest::{index_by_path, BackupMeta, IndexRow, META_FILE};
use crate::progress::NoopSink;
use crate::resolver::{mtime_millis, resolve_items};
use crate::sync::StorageProvider;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Outcome of comparing local and remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreDecision {
    /// Nothing local would be lost
    Ok,
    /// Some files differ and every one of them is newer locally
    ConflictLocalNewer,
    /// Some files differ and at least one is newer remotely (or equal in age)
    Conflict,
}

/// One side of a compared file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileState {
    /// `None` for a live database with WAL/SHM sidecars
    pub md5: Option<String>,
    pub size: u64,
    pub mtime: i64,
}

impl From<&IndexRow> for FileState {
    fn from(row: &IndexRow) -> Self {
        Self {
            md5: Some(row.md5.clone()),
            size: row.size,
            mtime: row.mtime,
        }
    }
}

/// Comparison of a path present on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail {
    pub path: String,
    pub local: FileState,
    pub remote: FileState,
    pub same_md5: bool,
    pub local_newer: bool,
    pub remote_newer: bool,
    pub ignored: bool,
}

impl ConflictDetail {
    fn new(path: &str, local: FileState, remote: FileState, ignore: &PathMatcher) -> Self {
        let same_md5 = matches!((&local.md5, &remote.md5), (Some(l), Some(r)) if l == r);
        Self {
            path: path.to_string(),
            same_md5,
            local_newer: local.mtime > remote.mtime,
            remote_newer: remote.mtime > local.mtime,
            ignored: ignore.matches(path),
            local,
            remote,
        }
    }

    /// Differs and counts towards the decision.
    fn relevant(&self) -> bool {
        !self.same_md5 && !self.ignored
    }
}

/// Read-only restore assessment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePlan {
    pub decision: RestoreDecision,
    pub meta: Option<BackupMeta>,
    /// Newest local mtime (ms)
    pub local_latest: Option<i64>,
    /// Newest remote mtime (ms)
    pub remote_latest: Option<i64>,
    pub local_count: usize,
    pub remote_count: usize,
    pub intersect_count: usize,
    pub intersect_paths: Vec<String>,
    pub local_newer_paths: Vec<String>,
    pub remote_newer_paths: Vec<String>,
    pub md5_equal: usize,
    pub md5_different: usize,
    pub details: Vec<ConflictDetail>,
}

impl RestorePlan {
    /// Differing paths that are not ignored.
    pub fn differing_paths(&self) -> impl Iterator<Item = &str> {
        self.details
            .iter()
            .filter(|d| d.relevant())
            .map(|d| d.path.as_str())
    }

    /// Differing paths a restore limited to `include` would overwrite.
    pub fn blocking_paths(&self, include: Option<&PathMatcher>) -> Vec<&str> {
        self.differing_paths()
            .filter(|path| include.map_or(true, |m| m.matches(path)))
            .collect()
    }
}

fn decide(details: &[ConflictDetail]) -> RestoreDecision {
    let mut differing = details.iter().filter(|d| d.relevant()).peekable();
    if differing.peek().is_none() {
        RestoreDecision::Ok
    } else if differing.all(|d| d.local_newer) {
        RestoreDecision::ConflictLocalNewer
    } else {
        RestoreDecision::Conflict
    }
}

/// Synthetic state of the live database.
///
/// The mtime is the newest of the main file and its sidecars. While a sidecar
/// exists the main file alone is not the database, so no md5 is computed.
pub(crate) fn local_database_state(live: &Path) -> Result<FileState> {
    let main = std::fs::metadata(live)
        .with_context(|| format!("Cannot stat database {}", live.display()))?;
    let mut mtime = mtime_millis(&main);
    let mut has_sidecar = false;

    for sidecar in sidecar_paths(live) {
        if let Ok(meta) = std::fs::metadata(&sidecar) {
            has_sidecar = true;
            mtime = mtime.max(mtime_millis(&meta));
        }
    }

    let md5 = if has_sidecar {
        None
    } else {
        Some(md5_file(live)?)
    };

    Ok(FileState {
        md5,
        size: main.len(),
        mtime,
    })
}

/// Build the plan from already collected state.
fn compare(
    local: &[IndexRow],
    remote: &[IndexRow],
    database: Option<FileState>,
    ignore: &PathMatcher,
    meta: Option<BackupMeta>,
) -> RestorePlan {
    let remote_by_path = index_by_path(remote);

    let mut details: Vec<ConflictDetail> = local
        .iter()
        .filter_map(|row| {
            remote_by_path
                .get(row.path.as_str())
                .map(|r| ConflictDetail::new(&row.path, row.into(), (*r).into(), ignore))
        })
        .collect();

    let local_count = local.len() + usize::from(database.is_some());
    let local_latest = local
        .iter()
        .map(|r| r.mtime)
        .chain(database.as_ref().map(|d| d.mtime))
        .max();

    if let (Some(state), Some(row)) = (database, remote_by_path.get(DATABASE_PATH)) {
        details.push(ConflictDetail::new(DATABASE_PATH, state, (*row).into(), ignore));
    }
    details.sort_by(|a, b| a.path.cmp(&b.path));

    let paths_where = |pred: fn(&ConflictDetail) -> bool| -> Vec<String> {
        details
            .iter()
            .filter(|d| pred(d))
            .map(|d| d.path.clone())
            .collect()
    };
    let intersect_paths = paths_where(|_| true);
    let local_newer_paths = paths_where(|d| d.relevant() && d.local_newer);
    let remote_newer_paths = paths_where(|d| d.relevant() && d.remote_newer);
    let md5_equal = details.iter().filter(|d| d.same_md5).count();

    RestorePlan {
        decision: decide(&details),
        meta,
        local_latest,
        remote_latest: remote.iter().map(|r| r.mtime).max(),
        local_count,
        remote_count: remote.len(),
        intersect_count: details.len(),
        intersect_paths,
        local_newer_paths,
        remote_newer_paths,
        md5_equal,
        md5_different: details.len() - md5_equal,
        details,
    }
}

fn read_remote_meta(provider: &dyn StorageProvider) -> Option<BackupMeta> {
    match provider.read_text(META_FILE) {
        Ok(Some(text)) => match BackupMeta::from_json(&text) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("[Restore] Ignoring unreadable {}: {:#}", META_FILE, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("[Restore] Cannot read {}: {:#}", META_FILE, e);
            None
        }
    }
}

/// Compare the local installation with the remote backup for `groups`.
///
/// Nothing is written locally or remotely.
pub fn plan_restore(
    provider: &dyn StorageProvider,
    groups: &[BackupGroup],
    ctx: &LocalContext,
    ignore_patterns: &[String],
) -> Result<RestorePlan> {
    let trio = database_trio_rels();
    let mut items = resolve_items(groups, ctx.data_root, ctx.emulators);
    items.retain(|i| !trio.contains(&i.rel));
    let local = build_local_index(&items, None, &NoopSink);

    let remote: Vec<IndexRow> = read_remote_index(provider)?
        .into_iter()
        .filter(|row| group_of(&row.path).is_some_and(|g| groups.contains(&g)))
        .collect();
    let meta = read_remote_meta(provider);

    let live = ctx.database_path();
    let database = if groups.contains(&BackupGroup::Database) && live.exists() {
        match local_database_state(&live) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("[Restore] Cannot inspect live database: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let plan = compare(
        &local,
        &remote,
        database,
        &PathMatcher::new(ignore_patterns),
        meta,
    );
    debug!(
        "[Restore] {} local, {} remote, {} shared, {} differing",
        plan.local_count, plan.remote_count, plan.intersect_count, plan.md5_different
    );
    info!("[Restore] Decision: {:?}", plan.decision);
    Ok(plan)
}
