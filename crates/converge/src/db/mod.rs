//! Durable controller state in SQLite.
//!
//! Three tables survive restarts: `applications` (status, revisions and
//! policy per application), `rollouts` (in-flight rolling updates) and
//! `rejected_resources` (specs the provider refused). Repos are free
//! functions over a shared [`Database`] handle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;

pub mod app_repo;
pub mod error;
pub mod migrations;
pub mod rejection_repo;
pub mod rollout_repo;

pub use error::DatabaseError;

/// How long a write waits for another process (e.g. `convergectl
/// set-auto-sync` next to a running controller) to release the file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the state store; clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the state file, creating it and its directory on first use,
    /// and brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::StateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self::prepare(conn)?;
        log::info!("State store at {}", path.display());
        Ok(db)
    }

    /// A throwaway store, used by tests and dry tooling.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    ///
    /// A panic in another holder does not corrupt SQLite's own state, so a
    /// poisoned lock is recovered rather than failing every later cycle.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }
}

/// `~/.converge/state.db`, used when the config names no database.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".converge").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application_count(db: &Database) -> u32 {
        db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM applications", [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn test_open_creates_state_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(application_count(&db), 0);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO applications (name, updated_at) VALUES ('shop', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(application_count(&Database::open(&path).unwrap()), 1);
    }

    #[test]
    fn test_clones_share_one_store() {
        let db = Database::open_in_memory().unwrap();
        let other = db.clone();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO applications (name, updated_at) VALUES ('shop', '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        assert_eq!(application_count(&other), 1);
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let db = Database::open_in_memory().unwrap();
        let holder = db.clone();
        let _ = std::thread::spawn(move || {
            holder
                .with_conn(|_| -> Result<(), DatabaseError> { panic!("cycle panicked mid-query") })
                .ok();
        })
        .join();
        assert_eq!(application_count(&db), 0);
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path().unwrap();
        assert!(path.ends_with(".converge/state.db"));
    }
}
