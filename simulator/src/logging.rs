use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

/// Log to stdout, and also to `path` when one is given so a failing seed can be attached
/// to a bug report.
pub(crate) fn step_writer(path: Option<&Path>) -> io::Result<BoxMakeWriter> {
    Ok(match path {
        Some(path) => {
            let file = Arc::new(File::create(path)?);
            BoxMakeWriter::new(io::stdout.and(file))
        }
        None => BoxMakeWriter::new(io::stdout),
    })
}

/// Keeps the first and the most recent step lines so a failure report shows how the run
/// started and what led up to the violation.
pub(crate) struct EventLog {
    first: Vec<String>,
    tail: VecDeque<String>,
    first_limit: usize,
    tail_limit: usize,
    skipped: u64,
}

impl EventLog {
    pub(crate) fn new(first_limit: usize, tail_limit: usize) -> Self {
        Self {
            first: Vec::with_capacity(first_limit),
            tail: VecDeque::with_capacity(tail_limit),
            first_limit,
            tail_limit,
            skipped: 0,
        }
    }

    pub(crate) fn record(&mut self, line: String) {
        tracing::debug!("{line}");
        if self.first.len() < self.first_limit {
            self.first.push(line);
            return;
        }
        if self.tail_limit == 0 {
            self.skipped += 1;
            return;
        }
        if self.tail.len() == self.tail_limit {
            self.tail.pop_front();
            self.skipped += 1;
        }
        self.tail.push_back(line);
    }

    pub(crate) fn dump_failure(&self, reason: &str) {
        tracing::error!("invariant violated: {reason}");
        for line in &self.first {
            tracing::error!("  {line}");
        }
        if self.skipped > 0 {
            tracing::error!("  ... {} steps omitted ...", self.skipped);
        }
        for line in &self.tail {
            tracing::error!("  {line}");
        }
    }
}
