//! A logical data source that owns its connection pool.
//!
//! The pool is built on the first lease, not when the service is created, and can be thrown
//! away and rebuilt with [`SqlService::destroy_pool`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::clock::{Clock, SystemClock};
use crate::config::PoolConfig;
use crate::error::SqlPoolError;
use crate::factory::ConnectionFactory;
use crate::jobs::JobRunner;
use crate::pool::{LeasedConnection, PoolStats, SqlConnectionPool};

pub struct SqlService<F: ConnectionFactory> {
    config: PoolConfig,
    factory: Arc<F>,
    runner: JobRunner,
    clock: Arc<dyn Clock>,
    pool: Mutex<Option<Arc<SqlConnectionPool<F>>>>,
    destroyed: AtomicBool,
}

impl<F: ConnectionFactory> SqlService<F> {
    /// # Errors
    /// Returns [`SqlPoolError::ConfigError`] if `config` does not validate.
    pub fn new(config: PoolConfig, factory: F, runner: JobRunner) -> Result<Self, SqlPoolError> {
        Self::with_clock(config, Arc::new(factory), runner, Arc::new(SystemClock))
    }

    /// # Errors
    /// Returns [`SqlPoolError::ConfigError`] if `config` does not validate.
    pub fn with_clock(
        config: PoolConfig,
        factory: Arc<F>,
        runner: JobRunner,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SqlPoolError> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            runner,
            clock,
            pool: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The current pool, creating and initializing it if there is none yet.
    ///
    /// # Errors
    /// [`SqlPoolError::Destroyed`] once the service is destroyed.
    pub fn pool(&self) -> Result<Arc<SqlConnectionPool<F>>, SqlPoolError> {
        let mut current = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SqlPoolError::Destroyed(self.config.name.clone()));
        }
        if let Some(pool) = current.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = SqlConnectionPool::with_clock(
            Arc::clone(&self.factory),
            self.runner.clone(),
            Arc::clone(&self.clock),
        );
        pool.initialize(self.config.clone())?;
        let pool = Arc::new(pool);
        *current = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Lease a connection from the service's pool, blocking until one is available.
    ///
    /// # Errors
    /// See [`SqlConnectionPool::lease_connection`].
    pub fn lease(&self) -> Result<LeasedConnection<F::Connection>, SqlPoolError> {
        self.pool()?.lease_connection()
    }

    /// Return a connection. Failures are logged, never reported.
    pub fn release(&self, conn: LeasedConnection<F::Connection>) {
        let current = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(pool) = current else {
            tracing::debug!(pool = %self.config.name, entry = conn.id(), "no pool to release into, dropping handle");
            return;
        };
        if let Err(err) = pool.release_connection(conn) {
            tracing::warn!(pool = %self.config.name, "Could not release connection: {err}");
        }
    }

    /// Lease a connection, run `func` on it and release it whatever `func` returned.
    ///
    /// # Errors
    /// The lease error, or [`SqlPoolError::Reclaimed`] if the connection was taken back
    /// before `func` could run.
    pub fn with_connection<R>(
        &self,
        func: impl FnOnce(&mut F::Connection) -> R,
    ) -> Result<R, SqlPoolError> {
        let conn = self.lease()?;
        let outcome = conn.with(func);
        self.release(conn);
        outcome
    }

    /// Inventory of the current pool, or `None` if no pool has been built yet.
    #[must_use]
    pub fn inventory(&self) -> Option<String> {
        self.current_pool().map(|pool| pool.inventory())
    }

    #[must_use]
    pub fn stats(&self) -> Option<PoolStats> {
        self.current_pool().map(|pool| pool.stats())
    }

    /// Destroy the current pool. The next lease builds a new one.
    pub fn destroy_pool(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            tracing::info!(pool = %self.config.name, "destroying pool of service");
            pool.destroy();
        }
    }

    /// Shut the service down for good.
    pub fn destroy(&self) {
        let pool = {
            let mut current = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            self.destroyed.store(true, Ordering::SeqCst);
            current.take()
        };
        if let Some(pool) = pool {
            pool.destroy();
        }
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn current_pool(&self) -> Option<Arc<SqlConnectionPool<F>>> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<F: ConnectionFactory> Drop for SqlService<F> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<F: ConnectionFactory> fmt::Debug for SqlService<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlService")
            .field("name", &self.config.name)
            .field("has_pool", &self.current_pool().is_some())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
