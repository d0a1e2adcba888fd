use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tokio::task;
use crate::error::{Result, GenieError};

pub mod migrate;

/// Database connection wrapper
///
/// Holds only the path; every operation opens its own connection on a
/// blocking thread, so the wrapper is cheap to clone into handlers.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = open_with_pragmas(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| GenieError::Internal(format!("Database task failed: {}", e)))?
    }
}

// WAL for concurrent readers while a request writes, foreign keys for
// extracted data -> line item cascades, busy_timeout so concurrent requests
// wait on the write lock instead of failing immediately.
fn open_with_pragmas(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(GenieError::Database)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA foreign_keys = ON; \
         PRAGMA busy_timeout = 5000; \
         PRAGMA temp_store = MEMORY;"
    )?;
    Ok(conn)
}
