use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlPoolError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Pool {0} is already initialized")]
    AlreadyInitialized(String),

    #[error("Pool is not initialized")]
    NotInitialized,

    #[error("Pool {0} has been destroyed")]
    Destroyed(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Pool {pool}: no connection became available within {waited_ms}ms")]
    WaitTimeout { pool: String, waited_ms: u64 },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection #{0} was reclaimed by the pool")]
    Reclaimed(u64),

    #[error("Other pool error: {0}")]
    Other(String),
}

impl SqlPoolError {
    /// True for the failures a caller can reasonably retry: creation errors, timeouts and
    /// connections reclaimed underneath the caller.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionError(_) | Self::WaitTimeout { .. } | Self::Reclaimed(_) => true,
            #[cfg(feature = "sqlite")]
            Self::SqliteError(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_classified() {
        assert!(SqlPoolError::ConnectionError("refused".into()).is_transient());
        assert!(SqlPoolError::Reclaimed(3).is_transient());
        assert!(!SqlPoolError::Destroyed("main".into()).is_transient());
        assert!(!SqlPoolError::Interrupted("stop".into()).is_transient());
    }

    #[test]
    fn wait_timeout_message_names_the_pool() {
        let err = SqlPoolError::WaitTimeout {
            pool: "orders".into(),
            waited_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "Pool orders: no connection became available within 250ms"
        );
    }
}
