use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sql_pool::test_utils::{MockConnection, MockFactory};
use sql_pool::{
    JobScheduler, LeaseOptions, LeasedConnection, ManualClock, PoolConfig, PoolStats,
    SqlConnectionPool, SqlPoolError,
};

use crate::args::SimConfig;
use crate::model::{Holding, Op, PoolModel, TaskState};

/// Far enough out that the background reaper never fires during a run; sweeps are driven
/// explicitly so a seed replays the same way.
const REAPER_OFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub(crate) enum SimError {
    PoolExhausted,
    Reclaimed,
    Pool(String),
}

#[derive(Debug, Clone)]
pub(crate) struct StepOutcome {
    pub(crate) result: Result<(), SimError>,
    pub(crate) conn_id: Option<u64>,
}

impl StepOutcome {
    fn ok(conn_id: Option<u64>) -> Self {
        Self {
            result: Ok(()),
            conn_id,
        }
    }

    fn err(error: SimError, conn_id: Option<u64>) -> Self {
        Self {
            result: Err(error),
            conn_id,
        }
    }
}

/// Drives a real pool over the mock factory and keeps the driver's model in step with it.
pub(crate) struct PoolShim {
    pub(crate) model: PoolModel,
    pub(crate) factory: Arc<MockFactory>,
    pub(crate) pool: SqlConnectionPool<MockFactory>,
    handles: HashMap<usize, LeasedConnection<MockConnection>>,
    leaked: Vec<LeasedConnection<MockConnection>>,
    // declared last so the pool is destroyed before its runtime goes away
    scheduler: JobScheduler,
}

impl PoolShim {
    pub(crate) fn new(config: &SimConfig, clock: &ManualClock) -> Result<Self, SqlPoolError> {
        let scheduler = JobScheduler::new()?;
        let factory = Arc::new(MockFactory::new());
        let pool = SqlConnectionPool::with_clock(
            Arc::clone(&factory),
            scheduler.runner(),
            Arc::new(clock.clone()),
        );
        pool.initialize(
            PoolConfig::builder("simulator")
                .pool_size(config.pool_size)
                .connection_lifetime(Duration::from_millis(config.lifetime_ms))
                .connection_busy_timeout(Duration::from_millis(config.busy_timeout_ms))
                .reaper_schedule(REAPER_OFF, REAPER_OFF)
                .finish(),
        )?;
        Ok(Self {
            model: PoolModel::new(config.pool_size, config.busy_timeout_ms),
            factory,
            pool,
            handles: HashMap::new(),
            leaked: Vec::new(),
            scheduler,
        })
    }

    pub(crate) fn apply(&mut self, task: &mut TaskState, op: Op, now_ms: u64) -> Result<StepOutcome, String> {
        match op {
            Op::Sleep(_) => Ok(StepOutcome::ok(task.conn_id)),
            Op::Lease => self.lease(task, now_ms),
            Op::Release => self.release(task),
            Op::Begin => self.execute(task, "BEGIN", Some(true)),
            Op::Commit => self.execute(task, "COMMIT", Some(false)),
            Op::Rollback => self.execute(task, "ROLLBACK", Some(false)),
            Op::Execute => self.execute(task, "SELECT 1", None),
            Op::Break => self.break_connection(task),
            Op::Leak => self.leak(task, now_ms),
            Op::Sweep => self.sweep(),
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Whether task `task_id`'s handle has been closed underneath it.
    pub(crate) fn is_reclaimed(&self, task_id: usize) -> bool {
        self.handles
            .get(&task_id)
            .is_some_and(LeasedConnection::is_reclaimed)
    }

    fn lease(&mut self, task: &mut TaskState, now_ms: u64) -> Result<StepOutcome, String> {
        if task.conn_id.is_some() {
            return Err(format!("task {} attempted double lease", task.id));
        }
        let conn = match self.pool.lease_connection_with(&LeaseOptions::no_wait()) {
            Ok(conn) => conn,
            Err(SqlPoolError::WaitTimeout { .. }) => {
                return Ok(StepOutcome::err(SimError::PoolExhausted, None));
            }
            Err(err) => return Err(format!("lease failed: {err}")),
        };
        let conn_id = conn.id();
        let holding = Holding {
            task_id: task.id,
            leased_at_ms: now_ms,
        };
        if let Some(previous) = self.model.held.insert(conn_id, holding) {
            return Err(format!(
                "conn {conn_id} leased to task {} while task {} still holds it",
                task.id, previous.task_id
            ));
        }
        self.handles.insert(task.id, conn);
        task.conn_id = Some(conn_id);
        task.in_tx = false;
        Ok(StepOutcome::ok(Some(conn_id)))
    }

    fn release(&mut self, task: &mut TaskState) -> Result<StepOutcome, String> {
        let conn = self.take_handle(task)?;
        let conn_id = conn.id();
        self.pool
            .release_connection(conn)
            .map_err(|err| format!("release of conn {conn_id} failed: {err}"))?;
        Ok(StepOutcome::ok(Some(conn_id)))
    }

    fn execute(&mut self, task: &mut TaskState, sql: &str, in_tx: Option<bool>) -> Result<StepOutcome, String> {
        let conn_id = task
            .conn_id
            .ok_or_else(|| format!("task {} ran {sql} without a connection", task.id))?;
        let handle = self
            .handles
            .get(&task.id)
            .ok_or_else(|| format!("task {} lost its handle", task.id))?;
        match handle.with(|raw| raw.execute(sql)) {
            Ok(_) => {
                if let Some(in_tx) = in_tx {
                    task.in_tx = in_tx;
                }
                Ok(StepOutcome::ok(Some(conn_id)))
            }
            Err(SqlPoolError::Reclaimed(_)) => {
                // the handle is dead; a release of it must be a silent no-op
                let conn = self.take_handle(task)?;
                self.pool
                    .release_connection(conn)
                    .map_err(|err| format!("release of reclaimed conn {conn_id} failed: {err}"))?;
                Ok(StepOutcome::err(SimError::Reclaimed, Some(conn_id)))
            }
            Err(err) => Ok(StepOutcome::err(SimError::Pool(err.to_string()), Some(conn_id))),
        }
    }

    fn break_connection(&mut self, task: &mut TaskState) -> Result<StepOutcome, String> {
        let conn_id = task
            .conn_id
            .ok_or_else(|| format!("task {} broke a connection it does not hold", task.id))?;
        self.factory.break_connection(conn_id);
        Ok(StepOutcome::ok(Some(conn_id)))
    }

    fn leak(&mut self, task: &mut TaskState, now_ms: u64) -> Result<StepOutcome, String> {
        let leased_at_ms = task
            .conn_id
            .and_then(|conn_id| self.model.held.get(&conn_id))
            .map_or(now_ms, |holding| holding.leased_at_ms);
        let conn = self.take_handle(task)?;
        let conn_id = conn.id();
        self.model.leaked.insert(conn_id, leased_at_ms);
        self.leaked.push(conn);
        Ok(StepOutcome::ok(Some(conn_id)))
    }

    fn sweep(&mut self) -> Result<StepOutcome, String> {
        self.pool
            .manage_pool()
            .map_err(|err| format!("sweep failed: {err}"))?;
        Ok(StepOutcome::ok(None))
    }

    /// Forget leaked handles whose connection the pool has closed.
    pub(crate) fn settle_leaks(&mut self) {
        let model = &mut self.model;
        self.leaked.retain(|conn| {
            let reclaimed = conn.is_reclaimed();
            if reclaimed {
                model.leaked.remove(&conn.id());
            }
            !reclaimed
        });
    }

    /// Destroy the pool twice, wait for every close and report whether each connection was
    /// closed exactly once.
    pub(crate) fn shutdown(&mut self) -> Result<(), String> {
        self.pool.destroy();
        self.pool.destroy();
        if !self.scheduler.runner().wait_for_detached(Duration::from_secs(10)) {
            return Err("closes did not finish after destroy".to_string());
        }
        if self.factory.has_double_close() {
            return Err("a connection was closed more than once".to_string());
        }
        if self.factory.open() != 0 {
            return Err(format!(
                "{} connections still open after destroy",
                self.factory.open()
            ));
        }
        Ok(())
    }

    fn take_handle(&mut self, task: &mut TaskState) -> Result<LeasedConnection<MockConnection>, String> {
        let conn_id = task
            .conn_id
            .take()
            .ok_or_else(|| format!("task {} has no connection", task.id))?;
        task.in_tx = false;
        self.model.held.remove(&conn_id);
        self.handles
            .remove(&task.id)
            .ok_or_else(|| format!("task {} lost its handle to conn {conn_id}", task.id))
    }
}
