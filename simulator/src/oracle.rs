use std::collections::HashMap;

use sql_pool::PoolStats;

use crate::model::{PoolModel, TaskState};

pub(crate) struct Oracle;

impl Oracle {
    /// Check the pool against the driver's model after a step.
    ///
    /// `reclaimed` reports whether a task's handle has been closed by the pool.
    pub(crate) fn check(
        tasks: &[TaskState],
        model: &PoolModel,
        stats: &PoolStats,
        now_ms: u64,
        reclaimed: impl Fn(usize) -> bool,
    ) -> Result<(), String> {
        if stats.total() > model.pool_size {
            return Err(format!(
                "pool holds {} connections but its size is {}",
                stats.total(),
                model.pool_size
            ));
        }
        if stats.destroyed {
            return Err("pool destroyed during the run".to_string());
        }

        let mut owners = HashMap::new();
        for task in tasks {
            if task.in_tx && task.conn_id.is_none() {
                return Err(format!("task {} in tx without conn", task.id));
            }
            let Some(conn_id) = task.conn_id else {
                continue;
            };
            if let Some(other) = owners.insert(conn_id, task.id) {
                return Err(format!(
                    "conn {conn_id} held by tasks {other} and {} at once",
                    task.id
                ));
            }
            let holding = model
                .held
                .get(&conn_id)
                .ok_or_else(|| format!("task {} holds untracked conn {conn_id}", task.id))?;
            if holding.task_id != task.id {
                return Err(format!("task {} and conn {conn_id} mismatch", task.id));
            }
            if model.within_busy_timeout(holding.leased_at_ms, now_ms) && reclaimed(task.id) {
                return Err(format!(
                    "conn {conn_id} of task {} closed before its busy timeout",
                    task.id
                ));
            }
        }

        // reclaimed entries leave `busy` before their close runs, so only the upper bound
        // and the count of live handles are exact
        let live = owners.len();
        if stats.busy > live + model.leaked.len() {
            return Err(format!(
                "pool reports {} busy connections but only {} are held or leaked",
                stats.busy,
                live + model.leaked.len()
            ));
        }
        let unexpired = model
            .held
            .values()
            .filter(|holding| model.within_busy_timeout(holding.leased_at_ms, now_ms))
            .count();
        if stats.busy < unexpired {
            return Err(format!(
                "pool reports {} busy connections but {unexpired} leases are still live",
                stats.busy
            ));
        }

        Ok(())
    }
}
