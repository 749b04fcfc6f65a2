use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::SqlPoolError;
use crate::factory::{ConnectionFactory, Validity};

/// A fake connection. It only counts statements and can be left dirty.
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    statements: usize,
    in_transaction: bool,
}

impl MockConnection {
    /// Factory-wide creation number, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn execute(&mut self, sql: &str) -> usize {
        self.statements += 1;
        match sql.trim().to_ascii_uppercase().as_str() {
            "BEGIN" => self.in_transaction = true,
            "COMMIT" | "ROLLBACK" => self.in_transaction = false,
            _ => {}
        }
        self.statements
    }

    #[must_use]
    pub fn statements(&self) -> usize {
        self.statements
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// Connection factory that keeps a ledger of everything it did.
///
/// A connection left inside a transaction fails the post-use check. Individual connections
/// can be broken so they fail the pre-lease check, and creation, setup or close can be made
/// to fail or stall.
#[derive(Debug, Default)]
pub struct MockFactory {
    last_id: AtomicU64,
    created: AtomicUsize,
    tests: AtomicUsize,
    fail_create: AtomicBool,
    fail_after_create: AtomicBool,
    fail_close: AtomicBool,
    close_delay_ms: AtomicU64,
    broken: Mutex<HashSet<u64>>,
    closes: Mutex<HashMap<u64, usize>>,
}

impl MockFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of pre-lease checks run so far.
    #[must_use]
    pub fn tests_run(&self) -> usize {
        self.tests.load(Ordering::SeqCst)
    }

    /// Number of distinct connections closed so far.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.lock_closes().len()
    }

    /// How many times connection `id` was closed.
    #[must_use]
    pub fn close_count(&self, id: u64) -> usize {
        self.lock_closes().get(&id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_closed(&self, id: u64) -> bool {
        self.close_count(id) > 0
    }

    /// True if any connection was closed more than once.
    #[must_use]
    pub fn has_double_close(&self) -> bool {
        self.lock_closes().values().any(|count| *count > 1)
    }

    /// Created minus closed.
    #[must_use]
    pub fn open(&self) -> usize {
        self.created().saturating_sub(self.closed())
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_after_create(&self, fail: bool) {
        self.fail_after_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Make every close block for `delay` first, like a hanging socket.
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms.store(
            u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
    }

    /// Make connection `id` fail its next pre-lease checks.
    pub fn break_connection(&self, id: u64) {
        self.broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    fn lock_closes(&self) -> std::sync::MutexGuard<'_, HashMap<u64, usize>> {
        self.closes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    fn create(&self) -> Result<MockConnection, SqlPoolError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SqlPoolError::ConnectionError("mock database refused the connection".into()));
        }
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id,
            statements: 0,
            in_transaction: false,
        })
    }

    fn after_create(&self, conn: &mut MockConnection) -> Result<(), SqlPoolError> {
        if self.fail_after_create.load(Ordering::SeqCst) {
            return Err(SqlPoolError::ConnectionError(format!(
                "setup of mock connection {} failed",
                conn.id
            )));
        }
        conn.execute("SET application_name = 'sql-pool'");
        Ok(())
    }

    fn test_connection(&self, conn: &mut MockConnection) -> Validity {
        self.tests.fetch_add(1, Ordering::SeqCst);
        let broken = self
            .broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&conn.id);
        if broken {
            Validity::Invalid(format!("mock connection {} is broken", conn.id))
        } else {
            Validity::Valid
        }
    }

    fn check_released(&self, conn: &mut MockConnection) -> Validity {
        if conn.in_transaction {
            Validity::Invalid(format!("mock connection {} has an open transaction", conn.id))
        } else {
            Validity::Valid
        }
    }

    fn close(&self, conn: MockConnection) -> Result<(), SqlPoolError> {
        let delay = self.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        *self.lock_closes().entry(conn.id).or_insert(0) += 1;
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(SqlPoolError::ConnectionError(format!(
                "mock connection {} did not close cleanly",
                conn.id
            )));
        }
        Ok(())
    }

    fn describe(&self) -> &'static str {
        "MockConnection"
    }
}
