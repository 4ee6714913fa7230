//! SaveSync Core Library
//!
//! Backup/restore engine for launcher data - config, emulator record stores (rms)
//! and the library database. Provides the following capabilities:
//! - Resolve declarative backup groups into concrete local files
//! - Hash files into a manifest (MD5, semantic hash for config.yml)
//! - Diff local and remote manifests and transfer only what changed
//! - Plan restores (conflict decision) and execute them best-effort
//! - Sync with S3-compatible storage, Dropbox (PKCE OAuth) or WebDAV
//!
//! Pipeline: Resolve -> Snapshot -> Hash -> Diff -> Transfer -> Manifest

pub mod backup;
pub mod config;
pub mod context;
pub mod database;
pub mod diff;
pub mod error;
pub mod groups;
pub mod hashing;
pub mod manifest;
pub mod progress;
pub mod resolver;
pub mod restore;
pub mod sync;
pub mod utils;

// Re-export main types
pub use backup::{run_backup, BackupOptions, BackupSummary};
pub use config::Config;
pub use context::LocalContext;
pub use database::{DatabaseHandle, SqliteDatabase};
pub use diff::{diff, DiffResult};
pub use error::ConfigError;
pub use groups::BackupGroup;
pub use manifest::{BackupMeta, BackupMode, IndexRow};
pub use progress::{NoopSink, ProgressEvent, ProgressSink};
pub use resolver::{BackupItem, EmulatorInstall, EmulatorSource};
pub use restore::{
    execute_restore, plan_restore, LibraryRescan, PathMatcher, RestoreDecision, RestoreOptions,
    RestorePlan, RestoreSummary,
};
pub use sync::{build_provider, ProviderParams, RemoteEntry, StorageProvider};
