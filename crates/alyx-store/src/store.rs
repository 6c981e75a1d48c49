use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::warn;

use crate::db::init_db;
use crate::error::{Result, StoreError};

const BUSY_ATTEMPTS: u32 = 3;
const BUSY_BACKOFF_BASE_MS: u64 = 50;

/// Handle to the single SQLite writer.
///
/// Wraps one connection in a `Mutex`; the claim transaction relies on this
/// exclusivity, so no second connection may ever be opened on the same file.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and initialise the
    /// schema.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    /// Run `op` against the connection, retrying on SQLITE_BUSY / SQLITE_LOCKED
    /// with exponential backoff. After the final attempt the error surfaces
    /// as [`StoreError::Busy`].
    pub(crate) fn with_retry<T>(
        &self,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.lock();
        let mut attempt = 0;
        loop {
            match op(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) => {
                    attempt += 1;
                    if attempt >= BUSY_ATTEMPTS {
                        return Err(StoreError::Busy {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let backoff = BUSY_BACKOFF_BASE_MS << (attempt - 1);
                    warn!(attempt, backoff_ms = backoff, "store busy, retrying");
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// True when the failure is a UNIQUE / constraint violation, used to map
/// duplicate webhook paths and schedule names onto a conflict error.
pub(crate) fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/alyx.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        drop(store);
        assert!(path.exists());
    }

    #[test]
    fn schema_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alyx.db");
        let p = path.to_str().unwrap();
        drop(Store::open(p).unwrap());
        // second open re-runs init_db against the existing schema
        drop(Store::open(p).unwrap());
    }
}
