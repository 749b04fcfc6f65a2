use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::entry::Slot;
use crate::error::SqlPoolError;

/// How long a lease may wait for capacity, and how it can be interrupted.
///
/// The default waits forever and cannot be cancelled.
#[derive(Debug, Clone, Default)]
pub struct LeaseOptions {
    /// `Some(Duration::ZERO)` makes the lease a non-blocking try.
    pub wait_timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl LeaseOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with [`SqlPoolError::WaitTimeout`] instead of blocking when the pool is saturated.
    #[must_use]
    pub fn no_wait() -> Self {
        Self::new().with_wait_timeout(Duration::ZERO)
    }

    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Cancelling `token` while the lease is blocked fails it with
    /// [`SqlPoolError::Interrupted`].
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// A connection on loan from a pool.
///
/// Hand it back with `release_connection`. A handle that is never released keeps its
/// capacity until the busy timeout, when the pool closes the connection underneath it.
#[must_use = "leased connections must be returned with release_connection"]
pub struct LeasedConnection<C> {
    pool_id: u64,
    id: u64,
    slot: Slot<C>,
}

impl<C> LeasedConnection<C> {
    pub(crate) fn new(pool_id: u64, id: u64, slot: Slot<C>) -> Self {
        Self { pool_id, id, slot }
    }

    /// Entry number of the connection, unique within its pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Use the underlying connection.
    ///
    /// # Errors
    /// Returns [`SqlPoolError::Reclaimed`] if the pool already closed this connection after its
    /// busy timeout, or [`SqlPoolError::ConnectionError`] if an earlier closure panicked
    /// while holding it.
    pub fn with<R>(&self, func: impl FnOnce(&mut C) -> R) -> Result<R, SqlPoolError> {
        let mut guard = self.slot.lock().map_err(|_| {
            SqlPoolError::ConnectionError(format!(
                "connection #{} was poisoned by a panic during use",
                self.id
            ))
        })?;
        let conn = guard.as_mut().ok_or(SqlPoolError::Reclaimed(self.id))?;
        Ok(func(conn))
    }

    /// True once the pool has taken the connection back and closed it.
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        self.slot.lock().map(|guard| guard.is_none()).unwrap_or(false)
    }
}

impl<C> fmt::Debug for LeasedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedConnection")
            .field("pool_id", &self.pool_id)
            .field("id", &self.id)
            .finish()
    }
}
