use std::sync::LazyLock;

use crate::jobs::{JobRunner, JobScheduler};

/// Shared job scheduler for tests and benches that do not care which runtime closes their
/// connections.
pub(crate) static SHARED_SCHEDULER: LazyLock<JobScheduler> = LazyLock::new(|| {
    JobScheduler::new().expect("Failed to create job scheduler for test utilities")
});

/// In-memory connection factory with scriptable failures.
pub mod mock;
pub mod test_helpers;

pub use mock::{MockConnection, MockFactory};
pub use test_helpers::wait_until;

/// A runner backed by the process-wide test scheduler.
#[must_use]
pub fn shared_runner() -> JobRunner {
    SHARED_SCHEDULER.runner()
}
