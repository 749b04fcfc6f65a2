use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::elapsed_since;
use crate::factory::Validity;

/// Shared home of one physical connection. `None` once the connection has been closed.
pub(crate) type Slot<C> = Arc<Mutex<Option<C>>>;

/// Bookkeeping record for one pooled connection.
pub(crate) struct PoolEntry<C> {
    pub(crate) id: u64,
    pub(crate) slot: Slot<C>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) lease_started_at: Option<DateTime<Utc>>,
    pub(crate) lease_count: u64,
}

impl<C> PoolEntry<C> {
    pub(crate) fn new(id: u64, conn: C, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            slot: Arc::new(Mutex::new(Some(conn))),
            created_at,
            lease_started_at: None,
            lease_count: 0,
        }
    }

    pub(crate) fn mark_leased(&mut self, now: DateTime<Utc>) {
        self.lease_started_at = Some(now);
        self.lease_count += 1;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.lease_started_at = None;
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>, lifetime: Duration) -> bool {
        elapsed_since(self.created_at, now) > lifetime
    }

    pub(crate) fn is_lease_timed_out(&self, now: DateTime<Utc>, busy_timeout: Duration) -> bool {
        self.lease_started_at
            .is_some_and(|started| elapsed_since(started, now) > busy_timeout)
    }

    /// Run a check against the connection. A closed or poisoned slot is never valid.
    pub(crate) fn check(&self, test: impl FnOnce(&mut C) -> Validity) -> Validity {
        match self.slot.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(conn) => test(conn),
                None => Validity::Invalid("connection is already closed".into()),
            },
            Err(_) => Validity::Invalid("connection was poisoned by a panic during use".into()),
        }
    }

    pub(crate) fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id,
            created_at: self.created_at,
            lease_started_at: self.lease_started_at,
            lease_count: self.lease_count,
        }
    }
}

impl<C> fmt::Debug for PoolEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("lease_started_at", &self.lease_started_at)
            .field("lease_count", &self.lease_count)
            .finish()
    }
}

/// Take the connection out of its slot so it can be closed. Only the first caller gets it.
pub(crate) fn take_connection<C>(slot: &Slot<C>) -> Option<C> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntrySnapshot {
    pub(crate) id: u64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) lease_started_at: Option<DateTime<Utc>>,
    pub(crate) lease_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn lease_bookkeeping_tracks_count_and_start() {
        let clock = ManualClock::starting_now();
        let mut entry = PoolEntry::new(1, "conn", clock.now());
        entry.mark_leased(clock.now());
        entry.mark_idle();
        entry.mark_leased(clock.now());
        assert_eq!(entry.lease_count, 2);
        assert_eq!(entry.lease_started_at, Some(clock.now()));
        entry.mark_idle();
        assert_eq!(entry.lease_started_at, None);
    }

    #[test]
    fn expiry_is_strictly_after_the_lifetime() {
        let clock = ManualClock::starting_now();
        let entry = PoolEntry::new(1, (), clock.now());
        clock.advance(Duration::from_millis(1000));
        assert!(!entry.is_expired(clock.now(), Duration::from_millis(1000)));
        clock.advance(Duration::from_millis(1));
        assert!(entry.is_expired(clock.now(), Duration::from_millis(1000)));
    }

    #[test]
    fn idle_entries_never_time_out() {
        let clock = ManualClock::starting_now();
        let entry = PoolEntry::new(1, (), clock.now());
        clock.advance(Duration::from_secs(3600));
        assert!(!entry.is_lease_timed_out(clock.now(), Duration::from_millis(1)));
    }

    #[test]
    fn closed_slot_fails_checks_and_is_taken_once() {
        let clock = ManualClock::starting_now();
        let entry = PoolEntry::new(7, 42_u32, clock.now());
        assert_eq!(take_connection(&entry.slot), Some(42));
        assert_eq!(take_connection(&entry.slot), None);
        assert!(!entry.check(|_| Validity::Valid).is_valid());
    }
}
