use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::entry::EntrySnapshot;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub pool_size: usize,
    pub idle: usize,
    pub busy: usize,
    /// Successful leases since the pool started.
    pub total_leases: u64,
    pub destroyed: bool,
}

impl PoolStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.idle + self.busy
    }
}

/// What one eviction sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    pub expired_idle: usize,
    pub reclaimed_busy: usize,
}

impl SweepOutcome {
    #[must_use]
    pub fn total(&self) -> usize {
        self.expired_idle + self.reclaimed_busy
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Human-readable report of every entry. No stable schema; meant for logs and admin pages.
pub(crate) fn format_inventory(
    name: &str,
    kind: &str,
    busy: &[EntrySnapshot],
    idle: &[EntrySnapshot],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Connection pool {name}");
    let _ = writeln!(out, "  total: {}", busy.len() + idle.len());
    let _ = writeln!(out, "  busy:  {}", busy.len());
    let _ = writeln!(out, "  idle:  {}", idle.len());
    for entry in busy {
        let since = entry
            .lease_started_at
            .map_or_else(|| "-".to_string(), format_timestamp);
        let _ = writeln!(
            out,
            "  busy #{} {kind} created={} leases={} leased_since={since}",
            entry.id,
            format_timestamp(entry.created_at),
            entry.lease_count,
        );
    }
    for entry in idle {
        let _ = writeln!(
            out,
            "  idle #{} {kind} created={} leases={}",
            entry.id,
            format_timestamp(entry.created_at),
            entry.lease_count,
        );
    }
    out
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}
