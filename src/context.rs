//! Local side of a backup or restore run.

use crate::database::DatabaseHandle;
use crate::groups::DATABASE_FILE;
use crate::resolver::EmulatorSource;
use std::path::{Path, PathBuf};

/// Collaborators describing the local installation.
#[derive(Clone, Copy)]
pub struct LocalContext<'a> {
    /// Launcher data root (primary root for static groups)
    pub data_root: &'a Path,
    /// Live emulator configuration
    pub emulators: &'a dyn EmulatorSource,
    /// Library database, if the host has one open
    pub database: Option<&'a dyn DatabaseHandle>,
}

impl<'a> LocalContext<'a> {
    pub fn new(data_root: &'a Path, emulators: &'a dyn EmulatorSource) -> Self {
        Self {
            data_root,
            emulators,
            database: None,
        }
    }

    pub fn with_database(mut self, database: &'a dyn DatabaseHandle) -> Self {
        self.database = Some(database);
        self
    }

    /// Live database path: the handle's, or `library.db` in the data root.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .map(|db| db.path().to_path_buf())
            .unwrap_or_else(|| self.data_root.join(DATABASE_FILE))
    }
}
