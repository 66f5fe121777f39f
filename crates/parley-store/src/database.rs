//! SQLite handle for the offline store.
//!
//! Opening a [`Database`] always brings the schema up to date, so every
//! typed helper can assume the current layout.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use parley_shared::constants::DATABASE_FILE_NAME;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Single-connection store. Not `Sync`; share it behind a mutex.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open `parley.db` in the platform data directory (for instance
    /// `~/.local/share/parley` on Linux), creating it on first use.
    pub fn new() -> Result<Self> {
        Self::open_at(&Self::default_path()?)
    }

    /// Location used by [`Database::new`]. The directory is created if needed.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("org", "parley", "parley").ok_or(StoreError::NoDataDir)?;
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        Ok(data_dir.join(DATABASE_FILE_NAME))
    }

    /// Open a file-backed database in WAL mode.
    pub fn open_at(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::prepare(conn)
    }

    /// Open a private in-memory database. Contents vanish on drop.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Raw connection, for queries the typed helpers do not cover.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable connection; transactions need it.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Backing file, `None` for in-memory databases.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_database_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.db");

        let db = Database::open_at(&file).unwrap();
        assert!(db.path().is_some());
        assert!(file.exists());
    }

    #[test]
    fn reopening_does_not_rerun_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.db");

        drop(Database::open_at(&file).unwrap());
        let db = Database::open_at(&file).unwrap();
        let version: u32 = db
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }
}
