use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Lease,
    Release,
    Begin,
    Commit,
    Rollback,
    Execute,
    /// Mark the held connection dead so its next pre-lease check fails.
    Break,
    /// Drop the handle on the floor without releasing it.
    Leak,
    Sweep,
    Sleep(u64),
}

#[derive(Debug, Clone)]
pub(crate) struct TaskState {
    pub(crate) id: usize,
    pub(crate) conn_id: Option<u64>,
    pub(crate) in_tx: bool,
}

/// What the driver believes about each connection it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Holding {
    pub(crate) task_id: usize,
    pub(crate) leased_at_ms: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct PoolModel {
    pub(crate) pool_size: usize,
    pub(crate) busy_timeout_ms: u64,
    pub(crate) held: BTreeMap<u64, Holding>,
    /// Leaked connections that the pool has not reclaimed yet.
    pub(crate) leaked: BTreeMap<u64, u64>,
}

impl PoolModel {
    pub(crate) fn new(pool_size: usize, busy_timeout_ms: u64) -> Self {
        Self {
            pool_size,
            busy_timeout_ms,
            held: BTreeMap::new(),
            leaked: BTreeMap::new(),
        }
    }

    /// True while the pool is not yet allowed to reclaim a lease taken at `leased_at_ms`.
    pub(crate) fn within_busy_timeout(&self, leased_at_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(leased_at_ms) <= self.busy_timeout_ms
    }
}
