use std::path::PathBuf;

use rusqlite::{Connection, OpenFlags};

use super::{ConnectionFactory, Validity};
use crate::error::SqlPoolError;

const DEFAULT_INIT_BATCH: &str = "PRAGMA foreign_keys = ON;";

/// Opens `rusqlite` connections against one database file (or a shared in-memory URI).
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    db_path: PathBuf,
    flags: OpenFlags,
    init_batch: Option<String>,
}

impl SqliteConnectionFactory {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            flags: OpenFlags::default(),
            init_batch: Some(DEFAULT_INIT_BATCH.to_string()),
        }
    }

    /// Replace the statements run on every new connection; `None` runs nothing.
    #[must_use]
    pub fn with_init_batch(mut self, init_batch: Option<String>) -> Self {
        self.init_batch = init_batch;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }
}

impl ConnectionFactory for SqliteConnectionFactory {
    type Connection = Connection;

    fn create(&self) -> Result<Connection, SqlPoolError> {
        Connection::open_with_flags(&self.db_path, self.flags).map_err(|err| {
            SqlPoolError::ConnectionError(format!(
                "failed to open sqlite database {}: {err}",
                self.db_path.display()
            ))
        })
    }

    fn after_create(&self, conn: &mut Connection) -> Result<(), SqlPoolError> {
        if let Some(batch) = &self.init_batch {
            conn.execute_batch(batch)?;
        }
        Ok(())
    }

    fn test_connection(&self, conn: &mut Connection) -> Validity {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(SqlPoolError::from)
            .into()
    }

    fn check_released(&self, conn: &mut Connection) -> Validity {
        if conn.is_autocommit() {
            Validity::Valid
        } else {
            Validity::Invalid("connection released inside an open transaction".into())
        }
    }

    fn close(&self, conn: Connection) -> Result<(), SqlPoolError> {
        conn.close().map_err(|(_, err)| SqlPoolError::SqliteError(err))
    }

    fn describe(&self) -> &'static str {
        "rusqlite::Connection"
    }
}
