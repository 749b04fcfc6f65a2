//! Background job scheduling for pools.
//!
//! A [`JobScheduler`] owns (or borrows) a tokio runtime. Pools only ever see the cheap,
//! cloneable [`JobRunner`], which can schedule fixed-delay jobs tagged with an execution hint,
//! cancel every job carrying a hint, and run fire-and-forget blocking work such as closing a
//! connection whose socket may hang.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;

use crate::error::SqlPoolError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Describes a repeating job.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub name: String,
    /// Jobs sharing a hint are cancelled together by [`JobRunner::cancel`].
    pub execution_hint: String,
    pub start_in: Duration,
    pub fixed_delay: Duration,
}

impl JobInput {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            execution_hint: name.clone(),
            name,
            start_in: Duration::ZERO,
            fixed_delay: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_execution_hint(mut self, hint: impl Into<String>) -> Self {
        self.execution_hint = hint.into();
        self
    }

    #[must_use]
    pub fn with_start_in(mut self, start_in: Duration) -> Self {
        self.start_in = start_in;
        self
    }

    #[must_use]
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.fixed_delay = delay;
        self
    }
}

/// Runtime host for background jobs. Dropping it cancels every scheduled job and gives
/// detached work a short grace period to finish.
pub struct JobScheduler {
    runtime: Option<Runtime>,
    runner: JobRunner,
}

impl JobScheduler {
    /// Start a dedicated two-thread runtime.
    ///
    /// # Errors
    /// Returns [`SqlPoolError::Other`] if the runtime cannot be built.
    pub fn new() -> Result<Self, SqlPoolError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sql-pool-jobs")
            .enable_time()
            .build()
            .map_err(|err| SqlPoolError::Other(format!("failed to start job runtime: {err}")))?;
        let runner = JobRunner::new(runtime.handle().clone());
        Ok(Self {
            runtime: Some(runtime),
            runner,
        })
    }

    /// Schedule onto a runtime owned by someone else.
    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            runtime: None,
            runner: JobRunner::new(handle),
        }
    }

    #[must_use]
    pub fn runner(&self) -> JobRunner {
        self.runner.clone()
    }
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("owns_runtime", &self.runtime.is_some())
            .field("runner", &self.runner)
            .finish()
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.runner.cancel_all();
        if let Some(runtime) = self.runtime.take() {
            // blocking shutdown panics inside an async context
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
        }
    }
}

/// Handle used by pools to schedule and cancel work.
#[derive(Clone)]
pub struct JobRunner {
    handle: Handle,
    hints: Arc<Mutex<HashMap<String, CancellationToken>>>,
    detached: Arc<AtomicUsize>,
}

impl JobRunner {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            hints: Arc::new(Mutex::new(HashMap::new())),
            detached: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `job` after `start_in`, then again `fixed_delay` after each run finishes, until the
    /// job's execution hint is cancelled. Each run happens on the blocking thread pool.
    pub fn schedule_with_fixed_delay<J>(&self, input: JobInput, job: J)
    where
        J: Fn() + Send + Sync + 'static,
    {
        let token = self.token_for(&input.execution_hint);
        let job = Arc::new(job);
        let JobInput {
            name,
            start_in,
            fixed_delay,
            ..
        } = input;
        tracing::debug!(job = %name, "scheduling job every {}ms", fixed_delay.as_millis());
        self.handle.spawn(async move {
            if sleep_unless_cancelled(&token, start_in).await {
                loop {
                    let run = Arc::clone(&job);
                    if let Err(err) = tokio::task::spawn_blocking(move || (*run)()).await {
                        tracing::warn!(job = %name, "scheduled job failed: {err}");
                    }
                    if !sleep_unless_cancelled(&token, fixed_delay).await {
                        break;
                    }
                }
            }
            tracing::debug!(job = %name, "job cancelled");
        });
    }

    /// Cancel every job scheduled under `execution_hint`. Returns false if none was known.
    pub fn cancel(&self, execution_hint: &str) -> bool {
        let token = self
            .hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_hint);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        let mut hints = self.hints.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, token) in hints.drain() {
            token.cancel();
        }
    }

    /// Fire-and-forget: run `job` on the blocking pool. Panics are logged, never propagated.
    pub fn run_detached<J>(&self, name: &str, job: J)
    where
        J: FnOnce() + Send + 'static,
    {
        let pending = PendingGuard::new(Arc::clone(&self.detached));
        let task = self.handle.spawn_blocking(move || {
            let _pending = pending;
            job();
        });
        let name = name.to_string();
        self.handle.spawn(async move {
            if let Err(err) = task.await {
                tracing::warn!(job = %name, "detached job failed: {err}");
            }
        });
    }

    /// Number of detached jobs that have not finished yet.
    #[must_use]
    pub fn pending_detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    /// Block until every detached job has finished or `timeout` elapses. Returns true when
    /// nothing is pending.
    pub fn wait_for_detached(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        while self.pending_detached() > 0 {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
        true
    }

    /// Number of execution hints with a live scheduled job.
    #[must_use]
    pub fn scheduled_jobs(&self) -> usize {
        self.hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn token_for(&self, execution_hint: &str) -> CancellationToken {
        self.hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(execution_hint.to_string())
            .or_default()
            .child_token()
    }
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("hints", &self.scheduled_jobs())
            .field("pending_detached", &self.pending_detached())
            .finish()
    }
}

async fn sleep_unless_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
