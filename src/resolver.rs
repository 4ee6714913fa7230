//! Item resolver - Turns selected groups into concrete local files.
//!
//! Static groups probe a fixed list of paths under the data root and its parent
//! ("roaming") root. Dynamic groups walk emulator directories taken from live
//! configuration and namespace every file as `external/<emulator>/<rms|config>/...`.

use crate::groups::{data_rel, BackupGroup, EXTERNAL_NAMESPACE};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A resolved local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupItem {
    /// Namespaced POSIX path used as manifest key
    pub rel: String,
    /// Physical location on disk
    pub abs: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Modification time, milliseconds since epoch
    pub mtime: i64,
}

impl BackupItem {
    /// Build an item from a file on disk.
    pub fn from_path(rel: impl Into<String>, abs: impl Into<PathBuf>) -> Result<Self> {
        let abs = abs.into();
        let meta = fs::metadata(&abs)?;
        Ok(Self {
            rel: rel.into(),
            size: meta.len(),
            mtime: mtime_millis(&meta),
            abs,
        })
    }
}

/// An installed emulator as described by live configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorInstall {
    /// Stable id used in the remote namespace (e.g. "kemulator")
    pub id: String,
    /// Path to the emulator executable or jar
    pub executable: PathBuf,
    /// Record store directory, relative to the executable directory
    #[serde(default = "default_rms_dir")]
    pub rms_dir: String,
    /// Config directory, relative to the executable directory
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
}

fn default_rms_dir() -> String {
    "rms".to_string()
}

fn default_config_dir() -> String {
    "config".to_string()
}

impl EmulatorInstall {
    pub fn new(id: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            executable: executable.into(),
            rms_dir: default_rms_dir(),
            config_dir: default_config_dir(),
        }
    }

    /// Directory holding the executable.
    pub fn base_dir(&self) -> &Path {
        self.executable
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(&self.executable)
    }
}

/// Live emulator configuration (external collaborator).
pub trait EmulatorSource {
    fn emulators(&self) -> Vec<EmulatorInstall>;
}

impl EmulatorSource for Vec<EmulatorInstall> {
    fn emulators(&self) -> Vec<EmulatorInstall> {
        self.clone()
    }
}

/// Remote namespace prefix mapped onto a live local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceMapping {
    pub group: BackupGroup,
    /// e.g. `external/kemulator/rms`
    pub namespace: String,
    pub local_dir: PathBuf,
}

impl NamespaceMapping {
    /// Local path of a manifest path under this namespace, if it belongs here.
    pub fn local_path_for(&self, rel: &str) -> Option<PathBuf> {
        let rest = rel.strip_prefix(&self.namespace)?.strip_prefix('/')?;
        if rest.is_empty() || rest.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return None;
        }
        Some(rest.split('/').fold(self.local_dir.clone(), |p, seg| p.join(seg)))
    }
}

/// Emulator ids go into remote paths; keep them to a safe alphabet.
fn namespace_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Namespace-to-directory mapping for the dynamic groups among `groups`.
///
/// Shared by backup (walk) and restore (download back).
pub fn namespace_mappings(
    groups: &[BackupGroup],
    emulators: &dyn EmulatorSource,
) -> Vec<NamespaceMapping> {
    let installs = emulators.emulators();
    let mut mappings = Vec::new();

    for group in groups.iter().filter(|g| g.is_dynamic()) {
        for install in &installs {
            let (segment, subdir) = match group {
                BackupGroup::Rms => ("rms", &install.rms_dir),
                BackupGroup::EmuConfig => ("config", &install.config_dir),
                _ => continue,
            };
            mappings.push(NamespaceMapping {
                group: *group,
                namespace: format!(
                    "{}/{}/{}",
                    EXTERNAL_NAMESPACE,
                    namespace_id(&install.id),
                    segment
                ),
                local_dir: install.base_dir().join(subdir),
            });
        }
    }

    mappings
}

/// Candidate roots for static paths: the data root and its parent.
pub fn candidate_roots(data_root: &Path) -> (PathBuf, Option<PathBuf>) {
    (data_root.to_path_buf(), data_root.parent().map(Path::to_path_buf))
}

/// Modification time in milliseconds since epoch.
pub fn mtime_millis(meta: &Metadata) -> i64 {
    meta.modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or(0)
}

fn regular_file(path: &Path) -> Option<Metadata> {
    fs::metadata(path).ok().filter(|m| m.is_file())
}

/// Pick the newer of the two candidate locations of a declared path.
fn probe_static(declared: &str, data_root: &Path) -> Option<BackupItem> {
    let (primary, roaming) = candidate_roots(data_root);
    let primary = primary.join(declared);
    let roaming = roaming.map(|r| r.join(declared));

    let primary_meta = regular_file(&primary);
    let roaming_meta = roaming.as_deref().and_then(regular_file);

    let (abs, meta) = match (primary_meta, roaming_meta, roaming) {
        (Some(p), Some(r), Some(roaming)) => {
            if mtime_millis(&r) > mtime_millis(&p) {
                info!(
                    "[Resolver] {} exists in both roots, roaming copy is newer",
                    declared
                );
                (roaming, r)
            } else {
                info!(
                    "[Resolver] {} exists in both roots, data copy is newer",
                    declared
                );
                (primary, p)
            }
        }
        (Some(p), _, _) => (primary, p),
        (None, Some(r), Some(roaming)) => (roaming, r),
        _ => return None,
    };

    Some(BackupItem {
        rel: data_rel(declared),
        abs,
        size: meta.len(),
        mtime: mtime_millis(&meta),
    })
}

fn walk_mapping(mapping: &NamespaceMapping, out: &mut BTreeMap<String, BackupItem>) {
    if !mapping.local_dir.is_dir() {
        debug!(
            "[Resolver] Skipping {}: {} is not a directory",
            mapping.namespace,
            mapping.local_dir.display()
        );
        return;
    }

    for entry in WalkDir::new(&mapping.local_dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("[Resolver] Cannot read entry under {}: {}", mapping.namespace, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(&mapping.local_dir) else {
            continue;
        };
        let posix: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let rel = format!("{}/{}", mapping.namespace, posix.join("/"));

        match entry.metadata() {
            Ok(meta) => {
                out.insert(
                    rel.clone(),
                    BackupItem {
                        rel,
                        abs: entry.path().to_path_buf(),
                        size: meta.len(),
                        mtime: mtime_millis(&meta),
                    },
                );
            }
            Err(e) => warn!("[Resolver] Cannot stat {}: {}", entry.path().display(), e),
        }
    }
}

/// Resolve `groups` into local files, sorted and unique by `rel`.
///
/// Missing files and directories are skipped, not errors.
pub fn resolve_items(
    groups: &[BackupGroup],
    data_root: &Path,
    emulators: &dyn EmulatorSource,
) -> Vec<BackupItem> {
    let mut items = BTreeMap::new();

    for group in groups {
        for declared in group.static_paths() {
            if let Some(item) = probe_static(declared, data_root) {
                items.insert(item.rel.clone(), item);
            }
        }
    }

    for mapping in namespace_mappings(groups, emulators) {
        walk_mapping(&mapping, &mut items);
    }

    debug!("[Resolver] Resolved {} items", items.len());
    items.into_values().collect()
}
