//! The strategy a pool uses to open, check and close raw connections.

#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::error::SqlPoolError;

/// Outcome of a liveness or post-use check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// The connection must not be reused; the reason ends up in the log.
    Invalid(String),
}

impl Validity {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }
}

impl From<Result<(), SqlPoolError>> for Validity {
    fn from(result: Result<(), SqlPoolError>) -> Self {
        match result {
            Ok(()) => Validity::Valid,
            Err(err) => Validity::Invalid(err.to_string()),
        }
    }
}

/// Creates and maintains the connections handed out by a
/// [`SqlConnectionPool`](crate::pool::SqlConnectionPool).
///
/// Every method runs on a pool worker or caller thread and may block. `close` runs on the
/// background job runner.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new raw connection.
    ///
    /// # Errors
    /// Any error is handed to the caller of `lease_connection`; the pool does not retry.
    fn create(&self) -> Result<Self::Connection, SqlPoolError>;

    /// Caller-side setup applied once to every new connection.
    ///
    /// # Errors
    /// A failure closes the new connection and fails the lease.
    fn after_create(&self, _conn: &mut Self::Connection) -> Result<(), SqlPoolError> {
        Ok(())
    }

    /// Pre-use check, run each time a connection is about to be leased.
    fn test_connection(&self, conn: &mut Self::Connection) -> Validity;

    /// Post-use check, run when a connection comes back. An invalid connection is discarded
    /// instead of returning to the idle set.
    fn check_released(&self, _conn: &mut Self::Connection) -> Validity {
        Validity::Valid
    }

    /// Close the connection. Best effort: the pool only logs the error.
    ///
    /// # Errors
    /// Whatever the underlying driver reports on close.
    fn close(&self, conn: Self::Connection) -> Result<(), SqlPoolError> {
        drop(conn);
        Ok(())
    }

    /// Short label for inventories and log lines.
    fn describe(&self) -> &'static str {
        std::any::type_name::<Self::Connection>()
    }
}
