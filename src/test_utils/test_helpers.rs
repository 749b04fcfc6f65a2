//! Helper utilities for testing and development.

use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
///
/// Closes run on a background job, so tests wait for their effects with this instead of
/// sleeping for a fixed time.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL);
    }
}
