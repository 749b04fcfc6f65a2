//! The connection pool.
//!
//! All state transitions (lease, release, sweep, destroy) are serialized by one pool-wide
//! mutex with a condition variable for callers waiting on capacity. Connections are closed on
//! the background [`JobRunner`], never on the caller's thread and never under the pool lock.
//!
//! Entry lifecycle: `idle -> (lease) -> busy -> (release, valid) -> idle`, or
//! `busy -> (release invalid | busy timeout) -> closed`, or `idle -> (lifetime) -> closed`.
//!
//! The busy-timeout reclaim races with a caller that is still using its connection. It is a
//! safety net against leaked leases: the caller's next [`LeasedConnection::with`] fails with
//! [`SqlPoolError::Reclaimed`] and its release is ignored.

mod entry;
mod inventory;
mod lease;

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock, elapsed_since};
use crate::config::PoolConfig;
use crate::error::SqlPoolError;
use crate::factory::{ConnectionFactory, Validity};
use crate::jobs::{JobInput, JobRunner};

use entry::{PoolEntry, take_connection};
pub use inventory::{PoolStats, SweepOutcome};
pub use lease::{LeaseOptions, LeasedConnection};

/// Upper bound on how long a cancellable lease sleeps before rechecking its token.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded pool of blocking connections.
///
/// Create it with [`SqlConnectionPool::new`], configure it once with
/// [`initialize`](Self::initialize), then [`lease_connection`](Self::lease_connection) and
/// [`release_connection`](Self::release_connection). Dropping the pool destroys it.
pub struct SqlConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

struct PoolInner<F: ConnectionFactory> {
    id: u64,
    factory: Arc<F>,
    runner: JobRunner,
    clock: Arc<dyn Clock>,
    settings: OnceLock<Settings>,
    destroyed: AtomicBool,
    state: Mutex<PoolState<F::Connection>>,
    available: Condvar,
}

struct Settings {
    config: PoolConfig,
    execution_hint: String,
}

struct PoolState<C> {
    idle: Vec<PoolEntry<C>>,
    busy: Vec<PoolEntry<C>>,
    last_entry_id: u64,
    total_leases: u64,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.busy.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    ExpiredIdle,
    TimedOutBusy,
    DirtyOnLease,
    DirtyOnRelease,
    FailedSetup,
    Destroying,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::ExpiredIdle => "expired idle connection",
            CloseReason::TimedOutBusy => "timed out busy connection",
            CloseReason::DirtyOnLease | CloseReason::DirtyOnRelease => "dirty connection",
            CloseReason::FailedSetup => "connection setup failed",
            CloseReason::Destroying => "destroying pool",
        };
        f.write_str(reason)
    }
}

/// An entry detached from the pool whose connection still has to be closed.
struct Doomed<C> {
    entry: PoolEntry<C>,
    reason: CloseReason,
}

impl<F: ConnectionFactory> SqlConnectionPool<F> {
    #[must_use]
    pub fn new(factory: F, runner: JobRunner) -> Self {
        Self::from_shared(Arc::new(factory), runner)
    }

    /// Build a pool around a factory the caller keeps a handle to.
    #[must_use]
    pub fn from_shared(factory: Arc<F>, runner: JobRunner) -> Self {
        Self::with_clock(factory, runner, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(factory: Arc<F>, runner: JobRunner, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                factory,
                runner,
                clock,
                settings: OnceLock::new(),
                destroyed: AtomicBool::new(false),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    busy: Vec::new(),
                    last_entry_id: 0,
                    total_leases: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Configure the pool and start its background reaper.
    ///
    /// The reaper first runs `reaper_start_delay` after this call and then every
    /// `reaper_interval`, until the pool is destroyed.
    ///
    /// # Errors
    /// Returns [`SqlPoolError::ConfigError`] for an invalid configuration,
    /// [`SqlPoolError::AlreadyInitialized`] on a second call and [`SqlPoolError::Destroyed`]
    /// if the pool was destroyed first.
    pub fn initialize(&self, config: PoolConfig) -> Result<(), SqlPoolError> {
        config.validate()?;
        let inner = &self.inner;
        let name = config.name.clone();
        // destroy cancels the reaper under this lock, so it either sees the settings or
        // initialize sees the pool destroyed
        let guard = inner.lock_state();
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(SqlPoolError::Destroyed(name));
        }
        let settings = Settings {
            execution_hint: format!("sql-connection-pool.{name}.{}", inner.id),
            config,
        };
        if inner.settings.set(settings).is_err() {
            return Err(SqlPoolError::AlreadyInitialized(name));
        }
        let settings = inner.settings()?;

        let weak: Weak<PoolInner<F>> = Arc::downgrade(inner);
        let runner = inner.runner.clone();
        let execution_hint = settings.execution_hint.clone();
        inner.runner.schedule_with_fixed_delay(
            JobInput::new(format!("{name} connection reaper"))
                .with_execution_hint(settings.execution_hint.clone())
                .with_start_in(settings.config.reaper_start_delay)
                .with_fixed_delay(settings.config.reaper_interval),
            move || match weak.upgrade() {
                Some(inner) => {
                    if let Err(err) = inner.manage_pool() {
                        tracing::warn!(pool = %inner.name(), "background sweep failed: {err}");
                    }
                }
                None => {
                    runner.cancel(&execution_hint);
                }
            },
        );
        drop(guard);
        tracing::info!(
            pool = %name,
            size = settings.config.pool_size,
            "initialized connection pool (lifetime {}ms, busy timeout {}ms)",
            settings.config.connection_lifetime.as_millis(),
            settings.config.connection_busy_timeout.as_millis()
        );
        Ok(())
    }

    /// Lease a connection, blocking for as long as it takes to get one.
    ///
    /// # Errors
    /// [`SqlPoolError::Destroyed`] once the pool is destroyed (also while waiting),
    /// [`SqlPoolError::NotInitialized`] before `initialize`, and any error the factory reports
    /// while creating a new connection.
    pub fn lease_connection(&self) -> Result<LeasedConnection<F::Connection>, SqlPoolError> {
        self.lease_connection_with(&LeaseOptions::default())
    }

    /// Lease a connection with a bounded wait and/or a cancellation token.
    ///
    /// # Errors
    /// Everything [`lease_connection`](Self::lease_connection) returns, plus
    /// [`SqlPoolError::WaitTimeout`] and [`SqlPoolError::Interrupted`].
    pub fn lease_connection_with(
        &self,
        options: &LeaseOptions,
    ) -> Result<LeasedConnection<F::Connection>, SqlPoolError> {
        let inner = &self.inner;
        let settings = inner.settings()?;
        inner.ensure_alive()?;
        let mut doomed = Vec::new();
        let leased = inner.lease_locked(settings, options, &mut doomed);
        inner.dispatch_closes(doomed);
        leased
    }

    /// Hand a leased connection back.
    ///
    /// A connection that fails the factory's post-use check is discarded instead of going
    /// back to the idle set; the caller never sees that failure. Releasing a connection the
    /// pool no longer tracks (it was reclaimed, or came from another pool) does nothing.
    ///
    /// # Errors
    /// [`SqlPoolError::Destroyed`] once the pool is destroyed and
    /// [`SqlPoolError::NotInitialized`] before `initialize`.
    pub fn release_connection(
        &self,
        conn: LeasedConnection<F::Connection>,
    ) -> Result<(), SqlPoolError> {
        let inner = &self.inner;
        inner.settings()?;
        inner.ensure_alive()?;
        let mut doomed = Vec::new();
        {
            let mut state = inner.lock_state();
            inner.ensure_alive()?;
            let position = if conn.pool_id() == inner.id {
                state.busy.iter().position(|entry| entry.id == conn.id())
            } else {
                None
            };
            match position {
                Some(position) => {
                    let mut entry = state.busy.remove(position);
                    match entry.check(|raw| inner.factory.check_released(raw)) {
                        Validity::Valid => {
                            entry.mark_idle();
                            tracing::debug!(pool = %inner.name(), entry = entry.id, "released connection to idle set");
                            state.idle.push(entry);
                        }
                        Validity::Invalid(reason) => {
                            tracing::warn!(pool = %inner.name(), entry = entry.id, "discarding released connection: {reason}");
                            doomed.push(Doomed {
                                entry,
                                reason: CloseReason::DirtyOnRelease,
                            });
                        }
                    }
                }
                None => {
                    tracing::debug!(pool = %inner.name(), entry = conn.id(), "released connection is not tracked by this pool");
                }
            }
            inner.available.notify_all();
        }
        drop(conn);
        inner.dispatch_closes(doomed);
        inner.manage_pool()?;
        Ok(())
    }

    /// Lease a connection, run `func` on it and release it again.
    ///
    /// # Errors
    /// Lease and release errors as for the individual calls, or [`SqlPoolError::Reclaimed`] if
    /// the connection was reclaimed while `func` was waiting for it.
    pub fn with_connection<R>(
        &self,
        func: impl FnOnce(&mut F::Connection) -> R,
    ) -> Result<R, SqlPoolError> {
        let leased = self.lease_connection()?;
        let outcome = leased.with(func);
        self.release_connection(leased)?;
        outcome
    }

    /// Evict idle connections past their lifetime and reclaim busy ones past the busy timeout.
    ///
    /// Runs on the reaper and opportunistically on every lease and release. Does nothing once
    /// the pool is destroyed.
    ///
    /// # Errors
    /// [`SqlPoolError::NotInitialized`] before `initialize`.
    pub fn manage_pool(&self) -> Result<SweepOutcome, SqlPoolError> {
        self.inner.manage_pool()
    }

    /// Shut the pool down: stop the reaper, close every connection and wake all waiters.
    /// Safe to call any number of times from any thread; only the first call does anything.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    #[must_use]
    pub fn config(&self) -> Option<&PoolConfig> {
        self.inner.settings.get().map(|settings| &settings.config)
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<F> {
        &self.inner.factory
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let state = inner.lock_state();
        PoolStats {
            name: inner.name().to_string(),
            pool_size: inner
                .settings
                .get()
                .map_or(0, |settings| settings.config.pool_size),
            idle: state.idle.len(),
            busy: state.busy.len(),
            total_leases: state.total_leases,
            destroyed: inner.destroyed.load(Ordering::SeqCst),
        }
    }

    /// Multi-line report of the pool's busy and idle entries.
    #[must_use]
    pub fn inventory(&self) -> String {
        let inner = &self.inner;
        let (busy, idle) = {
            let state = inner.lock_state();
            (
                state.busy.iter().map(PoolEntry::snapshot).collect::<Vec<_>>(),
                state.idle.iter().map(PoolEntry::snapshot).collect::<Vec<_>>(),
            )
        };
        inventory::format_inventory(inner.name(), inner.factory.describe(), &busy, &idle)
    }
}

impl<F: ConnectionFactory> Drop for SqlConnectionPool<F> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<F: ConnectionFactory> fmt::Debug for SqlConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlConnectionPool")
            .field("name", &self.name())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn settings(&self) -> Result<&Settings, SqlPoolError> {
        self.settings.get().ok_or(SqlPoolError::NotInitialized)
    }

    fn name(&self) -> &str {
        self.settings
            .get()
            .map_or("<uninitialized>", |settings| settings.config.name.as_str())
    }

    fn ensure_alive(&self) -> Result<(), SqlPoolError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(SqlPoolError::Destroyed(self.name().to_string()))
        } else {
            Ok(())
        }
    }

    // Candidates live in locals while the lock is held, so a panic in factory code cannot
    // leave the state half-updated and a poisoned lock is safe to keep using.
    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease_locked(
        &self,
        settings: &Settings,
        options: &LeaseOptions,
        doomed: &mut Vec<Doomed<F::Connection>>,
    ) -> Result<LeasedConnection<F::Connection>, SqlPoolError> {
        let started = Instant::now();
        // a timeout past the end of `Instant` waits without a deadline
        let deadline = options
            .wait_timeout
            .and_then(|timeout| started.checked_add(timeout));
        let mut state = self.lock_state();
        self.ensure_alive()?;
        self.collect_expired(&mut state, settings, doomed);

        loop {
            let Some(mut candidate) = self.next_candidate(&mut state, settings, doomed)? else {
                state = self.wait_for_capacity(state, options, started, deadline)?;
                continue;
            };
            match candidate.check(|raw| self.factory.test_connection(raw)) {
                Validity::Valid => {
                    candidate.mark_leased(self.clock.now());
                    state.total_leases += 1;
                    let leased =
                        LeasedConnection::new(self.id, candidate.id, Arc::clone(&candidate.slot));
                    tracing::debug!(
                        pool = %settings.config.name,
                        entry = candidate.id,
                        leases = candidate.lease_count,
                        "leased connection"
                    );
                    state.busy.push(candidate);
                    return Ok(leased);
                }
                Validity::Invalid(reason) => {
                    tracing::warn!(
                        pool = %settings.config.name,
                        entry = candidate.id,
                        "connection failed its pre-lease check, discarding: {reason}"
                    );
                    doomed.push(Doomed {
                        entry: candidate,
                        reason: CloseReason::DirtyOnLease,
                    });
                }
            }
        }
    }

    /// Take an idle entry (oldest first) or open a new one if there is room.
    fn next_candidate(
        &self,
        state: &mut PoolState<F::Connection>,
        settings: &Settings,
        doomed: &mut Vec<Doomed<F::Connection>>,
    ) -> Result<Option<PoolEntry<F::Connection>>, SqlPoolError> {
        if !state.idle.is_empty() {
            return Ok(Some(state.idle.remove(0)));
        }
        if state.total() >= settings.config.pool_size {
            return Ok(None);
        }

        let conn = self.factory.create()?;
        state.last_entry_id += 1;
        let entry = PoolEntry::new(state.last_entry_id, conn, self.clock.now());
        let setup = entry
            .slot
            .lock()
            .map_err(|_| SqlPoolError::ConnectionError("new connection slot poisoned".into()))
            .and_then(|mut guard| match guard.as_mut() {
                Some(raw) => self.factory.after_create(raw),
                None => Ok(()),
            });
        if let Err(err) = setup {
            tracing::warn!(pool = %settings.config.name, entry = entry.id, "connection setup failed: {err}");
            doomed.push(Doomed {
                entry,
                reason: CloseReason::FailedSetup,
            });
            return Err(err);
        }
        tracing::debug!(
            pool = %settings.config.name,
            entry = entry.id,
            "opened new connection ({} of {})",
            state.total() + 1,
            settings.config.pool_size
        );
        Ok(Some(entry))
    }

    fn wait_for_capacity<'a>(
        &self,
        state: MutexGuard<'a, PoolState<F::Connection>>,
        options: &LeaseOptions,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, PoolState<F::Connection>>, SqlPoolError> {
        if options.is_cancelled() {
            return Err(self.interrupted());
        }
        let mut slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(SqlPoolError::WaitTimeout {
                        pool: self.name().to_string(),
                        waited_ms: u64::try_from(started.elapsed().as_millis())
                            .unwrap_or(u64::MAX),
                    });
                }
                Some(deadline - now)
            }
            None => None,
        };
        if options.cancel.is_some() {
            slice = Some(slice.map_or(INTERRUPT_POLL, |slice| slice.min(INTERRUPT_POLL)));
        }

        let state = match slice {
            Some(slice) => {
                self.available
                    .wait_timeout(state, slice)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
        if options.is_cancelled() {
            return Err(self.interrupted());
        }
        self.ensure_alive()?;
        Ok(state)
    }

    fn interrupted(&self) -> SqlPoolError {
        SqlPoolError::Interrupted(format!(
            "thread interrupted while leasing a connection from {}",
            self.name()
        ))
    }

    fn manage_pool(&self) -> Result<SweepOutcome, SqlPoolError> {
        let settings = self.settings()?;
        let mut doomed = Vec::new();
        let outcome = {
            let mut state = self.lock_state();
            if self.destroyed.load(Ordering::SeqCst) {
                return Ok(SweepOutcome::default());
            }
            self.collect_expired(&mut state, settings, &mut doomed)
        };
        self.dispatch_closes(doomed);
        Ok(outcome)
    }

    /// Detach expired idle entries and timed-out busy entries. Must hold the pool lock.
    fn collect_expired(
        &self,
        state: &mut PoolState<F::Connection>,
        settings: &Settings,
        doomed: &mut Vec<Doomed<F::Connection>>,
    ) -> SweepOutcome {
        let now = self.clock.now();
        let lifetime = settings.config.connection_lifetime;
        let busy_timeout = settings.config.connection_busy_timeout;

        let (expired, idle): (Vec<_>, Vec<_>) = mem::take(&mut state.idle)
            .into_iter()
            .partition(|entry| entry.is_expired(now, lifetime));
        state.idle = idle;
        let (timed_out, busy): (Vec<_>, Vec<_>) = mem::take(&mut state.busy)
            .into_iter()
            .partition(|entry| entry.is_lease_timed_out(now, busy_timeout));
        state.busy = busy;

        let outcome = SweepOutcome {
            expired_idle: expired.len(),
            reclaimed_busy: timed_out.len(),
        };
        for entry in expired {
            tracing::debug!(
                pool = %settings.config.name,
                entry = entry.id,
                "closing idle connection older than {}ms",
                lifetime.as_millis()
            );
            doomed.push(Doomed {
                entry,
                reason: CloseReason::ExpiredIdle,
            });
        }
        for entry in timed_out {
            let held_for = entry
                .lease_started_at
                .map_or(Duration::ZERO, |started| elapsed_since(started, now));
            tracing::warn!(
                pool = %settings.config.name,
                entry = entry.id,
                "reclaiming connection leased {}ms ago; its holder never released it",
                held_for.as_millis()
            );
            doomed.push(Doomed {
                entry,
                reason: CloseReason::TimedOutBusy,
            });
        }
        if !outcome.is_empty() {
            self.available.notify_all();
        }
        outcome
    }

    fn destroy(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let doomed = {
            let mut state = self.lock_state();
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(settings) = self.settings.get() {
                self.runner.cancel(&settings.execution_hint);
            }
            let idle = mem::take(&mut state.idle);
            let busy = mem::take(&mut state.busy);
            self.available.notify_all();
            idle.into_iter()
                .chain(busy)
                .map(|entry| Doomed {
                    entry,
                    reason: CloseReason::Destroying,
                })
                .collect::<Vec<_>>()
        };
        tracing::info!(pool = %self.name(), "destroying pool, closing {} connections", doomed.len());
        self.dispatch_closes(doomed);
    }

    fn dispatch_closes(&self, doomed: Vec<Doomed<F::Connection>>) {
        for Doomed { entry, reason } in doomed {
            let factory = Arc::clone(&self.factory);
            let pool = self.name().to_string();
            let id = entry.id;
            let slot = entry.slot;
            self.runner
                .run_detached(&format!("close connection #{id} of {pool}"), move || {
                    let Some(conn) = take_connection(&slot) else {
                        tracing::debug!(pool = %pool, entry = id, "connection already closed ({reason})");
                        return;
                    };
                    match factory.close(conn) {
                        Ok(()) => tracing::debug!(pool = %pool, entry = id, "closed connection ({reason})"),
                        Err(err) => tracing::warn!(pool = %pool, entry = id, "failed to close connection ({reason}): {err}"),
                    }
                });
        }
    }
}
