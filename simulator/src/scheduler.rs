use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use sql_pool::ManualClock;

/// Simulated milliseconds, mirrored onto the [`ManualClock`] the pool reads.
pub(crate) struct FakeClock {
    pub(crate) now_ms: u64,
    pool_clock: ManualClock,
}

impl FakeClock {
    pub(crate) fn new(pool_clock: ManualClock) -> Self {
        Self {
            now_ms: 0,
            pool_clock,
        }
    }

    fn set(&mut self, now_ms: u64) {
        if now_ms > self.now_ms {
            self.pool_clock
                .advance(Duration::from_millis(now_ms - self.now_ms));
            self.now_ms = now_ms;
        }
    }
}

pub(crate) struct Scheduler {
    ready: Vec<usize>,
    timers: BTreeMap<u64, Vec<usize>>,
    pub(crate) clock: FakeClock,
}

impl Scheduler {
    pub(crate) fn new(task_count: usize, pool_clock: ManualClock) -> Self {
        let ready = (0..task_count).collect();
        Self {
            ready,
            timers: BTreeMap::new(),
            clock: FakeClock::new(pool_clock),
        }
    }

    pub(crate) fn sleep(&mut self, task_id: usize, duration_ms: u64) {
        let wake_at = self.clock.now_ms.saturating_add(duration_ms.max(1));
        self.timers.entry(wake_at).or_default().push(task_id);
    }

    pub(crate) fn advance_time(&mut self, elapsed_ms: u64) {
        let now_ms = self.clock.now_ms.saturating_add(elapsed_ms.max(1));
        self.clock.set(now_ms);
        self.wake_due();
    }

    pub(crate) fn next_ready(&mut self, rng: &mut ChaCha8Rng) -> Option<usize> {
        if self.ready.is_empty() {
            let (wake_at, mut tasks) = self.timers.pop_first()?;
            self.clock.set(wake_at);
            self.ready.append(&mut tasks);
            self.wake_due();
        }
        let idx = rng.random_range(0..self.ready.len());
        Some(self.ready.swap_remove(idx))
    }

    pub(crate) fn mark_ready(&mut self, task_id: usize) {
        self.ready.push(task_id);
    }

    fn wake_due(&mut self) {
        while let Some((time, _)) = self.timers.first_key_value() {
            if *time > self.clock.now_ms {
                break;
            }
            if let Some((_, mut tasks)) = self.timers.pop_first() {
                self.ready.append(&mut tasks);
            }
        }
    }
}
