use rand::Rng;
use rand_chacha::ChaCha8Rng;
use sql_pool::ManualClock;

use crate::args::SimConfig;
use crate::backend::{PoolShim, SimError};
use crate::logging::EventLog;
use crate::model::{Op, TaskState};
use crate::oracle::Oracle;
use crate::scheduler::Scheduler;

pub(crate) fn run(config: SimConfig, rng: &mut ChaCha8Rng) -> Result<(), String> {
    let clock = ManualClock::starting_now();
    let mut shim =
        PoolShim::new(&config, &clock).map_err(|err| format!("failed to start pool: {err}"))?;
    let mut tasks: Vec<TaskState> = (0..config.tasks)
        .map(|id| TaskState {
            id,
            conn_id: None,
            in_tx: false,
        })
        .collect();
    let mut scheduler = Scheduler::new(config.tasks, clock);
    let mut events = EventLog::new(config.first_steps, config.tail_steps);

    let max_steps = config.iterations.unwrap_or(u64::MAX);
    let max_time = config.duration_ms.unwrap_or(u64::MAX);

    let mut step: u64 = 0;
    let mut exhausted: u64 = 0;
    while step < max_steps && scheduler.clock.now_ms <= max_time {
        let Some(task_id) = scheduler.next_ready(rng) else {
            break;
        };
        let in_flight_tx = tasks.iter().filter(|t| t.in_tx).count();
        let op = next_op(&tasks[task_id], in_flight_tx, &config, rng);
        let op_display = format_op(&op);
        let now_ms = scheduler.clock.now_ms;

        let step_outcome = match shim.apply(&mut tasks[task_id], op.clone(), now_ms) {
            Ok(step_outcome) => step_outcome,
            Err(reason) => {
                events.dump_failure(&reason);
                return Err(reason);
            }
        };
        if let Op::Sleep(ms) = op {
            scheduler.sleep(task_id, ms);
        } else {
            scheduler.mark_ready(task_id);
        }
        if matches!(step_outcome.result, Err(SimError::PoolExhausted)) {
            exhausted += 1;
        }
        let result_label = match step_outcome.result {
            Ok(()) => "Ok".to_string(),
            Err(ref err) => format!("Err({err:?})"),
        };
        let conn_label = step_outcome
            .conn_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        events.record(format!(
            "step={step} time={now_ms}ms task={task_id} op={op_display} conn={conn_label} result={result_label}"
        ));

        shim.settle_leaks();
        let stats = shim.stats();
        if let Err(reason) = Oracle::check(&tasks, &shim.model, &stats, now_ms, |task| {
            shim.is_reclaimed(task)
        }) {
            events.dump_failure(&reason);
            return Err(reason);
        }
        scheduler.advance_time(1);
        step += 1;
    }

    let stats = shim.stats();
    if let Err(reason) = shim.shutdown() {
        events.dump_failure(&reason);
        return Err(reason);
    }

    tracing::info!(
        "complete: steps={} time={}ms tasks={} pool_size={} leases={} exhausted={} created={}",
        step,
        scheduler.clock.now_ms,
        config.tasks,
        config.pool_size,
        stats.total_leases,
        exhausted,
        shim.factory.created()
    );
    Ok(())
}

fn next_op(task: &TaskState, in_flight_tx: usize, config: &SimConfig, rng: &mut ChaCha8Rng) -> Op {
    if rng.random::<f64>() < config.sleep_rate {
        return Op::Sleep(rng.random_range(1..=50));
    }
    if rng.random::<f64>() < config.sweep_rate {
        return Op::Sweep;
    }

    if task.conn_id.is_none() {
        return Op::Lease;
    }

    if task.in_tx {
        let weights = [
            (Op::Execute, 0.55),
            (Op::Commit, 0.20),
            (Op::Rollback, 0.15),
            // released mid-transaction: the pool must discard it as dirty
            (Op::Release, 0.02),
            (Op::Leak, config.leak_rate),
        ];
        return choose_weighted(&weights, rng);
    }

    let mut weights = vec![
        (Op::Execute, 0.45),
        (Op::Release, 0.25),
        (Op::Break, config.break_rate),
        (Op::Leak, config.leak_rate),
    ];
    if in_flight_tx < config.max_in_flight_tx {
        weights.push((Op::Begin, 0.20));
    }
    choose_weighted(&weights, rng)
}

fn choose_weighted(items: &[(Op, f64)], rng: &mut ChaCha8Rng) -> Op {
    let total: f64 = items.iter().map(|(_, weight)| weight.max(0.0)).sum();
    if total <= f64::EPSILON {
        return items
            .first()
            .map_or(Op::Sleep(1), |(op, _)| op.clone());
    }
    let mut target = rng.random::<f64>() * total;
    for (op, weight) in items {
        let w = weight.max(0.0);
        if target < w {
            return op.clone();
        }
        target -= w;
    }
    items.last().map_or(Op::Sleep(1), |(op, _)| op.clone())
}

fn format_op(op: &Op) -> String {
    match op {
        Op::Sleep(ms) => format!("Sleep({ms}ms)"),
        other => format!("{other:?}"),
    }
}
