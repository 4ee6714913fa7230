//! Library database handle - online snapshot and close for backup/restore.
//!
//! The launcher keeps `library.db` open in WAL mode, so copying the file
//! (plus `-wal`/`-shm`) is not a consistent backup. Backups take a point-in-time
//! copy through the SQLite online backup API instead.

use anyhow::{Context, Result};
use rusqlite::backup::Backup;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Pages copied per backup step.
const PAGES_PER_STEP: std::os::raw::c_int = 100;

/// WAL and SHM sidecars of a live database file.
pub fn sidecar_paths(live: &Path) -> [PathBuf; 2] {
    ["-wal", "-shm"].map(|suffix| {
        let mut name = live.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    })
}

/// Library database collaborator.
pub trait DatabaseHandle {
    /// Live database path (`library.db`).
    fn path(&self) -> &Path;

    /// Write a consistent snapshot of the live database to `dest`.
    fn snapshot_to(&self, dest: &Path) -> Result<()>;

    /// Close every connection so the file can be replaced.
    fn close(&self) -> Result<()>;
}

/// SQLite implementation backed by rusqlite.
pub struct SqliteDatabase {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteDatabase {
    /// Handle for the database at `path`. The connection is opened lazily.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
        }
    }

    /// Run `f` with the (lazily opened) connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database lock poisoned"))?;
        if guard.is_none() {
            let conn = Connection::open(&self.path)
                .with_context(|| format!("Cannot open database: {}", self.path.display()))?;
            *guard = Some(conn);
        }
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => anyhow::bail!("Database connection unavailable"),
        }
    }
}

impl DatabaseHandle for SqliteDatabase {
    fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot_to(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            std::fs::remove_file(dest)
                .with_context(|| format!("Cannot remove stale snapshot {}", dest.display()))?;
        }

        self.with_connection(|src| {
            let mut dst = Connection::open(dest)
                .with_context(|| format!("Cannot create snapshot {}", dest.display()))?;
            {
                let backup = Backup::new(src, &mut dst)?;
                backup
                    .run_to_completion(PAGES_PER_STEP, Duration::from_millis(50), None)
                    .context("Online backup failed")?;
            }
            // Keep the snapshot self-contained (no -wal next to it)
            dst.query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))?;
            Ok(())
        })?;

        debug!("[Database] Snapshot written to {}", dest.display());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database lock poisoned"))?;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| e)
                .context("Cannot close database")?;
            info!("[Database] Closed {}", self.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(path: &Path) -> Result<()> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(
            "CREATE TABLE games (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
             INSERT INTO games (title) VALUES ('Bounce'), ('Snake');",
        )?;
        Ok(())
    }

    #[test]
    fn test_snapshot_contains_rows() -> Result<()> {
        let temp = TempDir::new()?;
        let live = temp.path().join("library.db");
        seed(&live)?;

        let db = SqliteDatabase::new(&live);
        let snapshot = temp.path().join("library.snapshot.db");
        db.snapshot_to(&snapshot)?;

        let copy = Connection::open(&snapshot)?;
        let count: i64 = copy.query_row("SELECT COUNT(*) FROM games", [], |r| r.get(0))?;
        assert_eq!(count, 2);
        assert!(!temp.path().join("library.snapshot.db-wal").exists());
        Ok(())
    }

    #[test]
    fn test_sidecar_paths() {
        let [wal, shm] = sidecar_paths(Path::new("/data/library.db"));
        assert_eq!(wal, PathBuf::from("/data/library.db-wal"));
        assert_eq!(shm, PathBuf::from("/data/library.db-shm"));
    }

    #[test]
    fn test_close_then_reopen() -> Result<()> {
        let temp = TempDir::new()?;
        let live = temp.path().join("library.db");
        seed(&live)?;

        let db = SqliteDatabase::new(&live);
        db.with_connection(|c| Ok(c.execute("INSERT INTO games (title) VALUES ('Tetris')", [])?))?;
        db.close()?;
        db.close()?;

        let count: i64 =
            db.with_connection(|c| Ok(c.query_row("SELECT COUNT(*) FROM games", [], |r| r.get(0))?))?;
        assert_eq!(count, 3);
        Ok(())
    }
}
