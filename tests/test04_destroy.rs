use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use sql_pool::test_utils::{MockFactory, wait_until};
use sql_pool::{
    JobScheduler, LeaseOptions, ManualClock, PoolConfig, SqlConnectionPool, SqlPoolError,
};

fn mock_pool(
    scheduler: &JobScheduler,
    pool_size: usize,
) -> Result<(Arc<MockFactory>, SqlConnectionPool<MockFactory>), SqlPoolError> {
    let factory = Arc::new(MockFactory::new());
    let pool = SqlConnectionPool::with_clock(
        Arc::clone(&factory),
        scheduler.runner(),
        Arc::new(ManualClock::starting_now()),
    );
    pool.initialize(PoolConfig::builder("destroy").pool_size(pool_size).finish())?;
    Ok((factory, pool))
}

#[test]
fn destroy_closes_idle_and_busy_connections() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 3)?;

    let idle = pool.lease_connection()?;
    let busy = pool.lease_connection()?;
    pool.release_connection(idle)?;

    pool.destroy();
    assert!(pool.is_destroyed());
    let stats = pool.stats();
    assert_eq!(stats.total(), 0);
    assert!(stats.destroyed);
    assert!(wait_until(Duration::from_secs(5), || factory.closed() == 2));
    assert!(busy.is_reclaimed());
    Ok(())
}

#[test]
fn repeated_destroy_closes_each_connection_once() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 4)?;

    let mut held: Vec<_> = (0..4)
        .map(|_| pool.lease_connection())
        .collect::<Result<_, _>>()?;
    pool.release_connection(held.remove(0))?;

    for _ in 0..5 {
        pool.destroy();
    }
    assert!(wait_until(Duration::from_secs(5), || factory.closed() == 4));
    assert!(scheduler.runner().wait_for_detached(Duration::from_secs(5)));
    assert!(!factory.has_double_close());
    Ok(())
}

/// Two threads destroy the same pool at once: every connection is closed exactly once and
/// neither caller sees an error.
#[test]
fn concurrent_destroy_is_exactly_once() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 3)?;

    let _held: Vec<_> = (0..3)
        .map(|_| pool.lease_connection())
        .collect::<Result<_, _>>()?;
    let barrier = Barrier::new(2);
    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                barrier.wait();
                pool.destroy();
            });
        }
    });

    assert!(wait_until(Duration::from_secs(5), || factory.closed() == 3));
    assert!(scheduler.runner().wait_for_detached(Duration::from_secs(5)));
    for id in 1..=3 {
        assert_eq!(factory.close_count(id), 1);
    }
    Ok(())
}

#[test]
fn lease_and_release_fail_fast_after_destroy() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let (_factory, pool) = mock_pool(&scheduler, 1)?;

    let conn = pool.lease_connection()?;
    pool.destroy();

    let started = Instant::now();
    assert!(matches!(
        pool.lease_connection(),
        Err(SqlPoolError::Destroyed(name)) if name == "destroy"
    ));
    assert!(matches!(
        pool.lease_connection_with(&LeaseOptions::no_wait()),
        Err(SqlPoolError::Destroyed(_))
    ));
    assert!(matches!(
        pool.release_connection(conn),
        Err(SqlPoolError::Destroyed(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(matches!(
        pool.initialize(PoolConfig::new("again")),
        Err(SqlPoolError::Destroyed(_))
    ));
    Ok(())
}

#[test]
fn destroy_wakes_blocked_leases() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let (_factory, pool) = mock_pool(&scheduler, 1)?;

    let _held = pool.lease_connection()?;
    thread::scope(|scope| {
        let waiters: Vec<_> = (0..3)
            .map(|_| scope.spawn(|| pool.lease_connection()))
            .collect();
        thread::sleep(Duration::from_millis(50));
        pool.destroy();
        for waiter in waiters {
            let outcome = waiter.join().unwrap();
            assert!(matches!(outcome, Err(SqlPoolError::Destroyed(_))));
        }
    });
    Ok(())
}

#[test]
fn destroyed_before_initialize_cannot_start() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let pool = SqlConnectionPool::new(MockFactory::new(), scheduler.runner());
    pool.destroy();
    assert!(matches!(
        pool.initialize(PoolConfig::new("late")),
        Err(SqlPoolError::Destroyed(_))
    ));
    Ok(())
}

/// Whichever of `initialize` and `destroy` wins, no reaper job outlives the pool.
#[test]
fn initialize_racing_destroy_leaves_no_reaper_behind() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let runner = scheduler.runner();

    for round in 0..500 {
        let pool = SqlConnectionPool::new(MockFactory::new(), runner.clone());
        let barrier = Barrier::new(2);
        let initialized = thread::scope(|scope| {
            let init = scope.spawn(|| {
                barrier.wait();
                pool.initialize(PoolConfig::new(format!("race-{round}")))
            });
            barrier.wait();
            pool.destroy();
            init.join()
                .map_err(|_| SqlPoolError::Other("initialize panicked".into()))
        })?;
        match initialized {
            Ok(()) | Err(SqlPoolError::Destroyed(_)) => {}
            Err(err) => return Err(err),
        }
        assert_eq!(runner.scheduled_jobs(), 0, "round {round} left a reaper running");
        drop(pool);
    }
    Ok(())
}

#[test]
fn reaper_is_cancelled_by_destroy() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let runner = scheduler.runner();
    let (_factory, pool) = mock_pool(&scheduler, 1)?;
    assert_eq!(runner.scheduled_jobs(), 1);
    pool.destroy();
    assert_eq!(runner.scheduled_jobs(), 0);
    Ok(())
}

#[test]
fn dropping_the_pool_destroys_it() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 2)?;

    let conn = pool.lease_connection()?;
    pool.release_connection(conn)?;
    let _held = pool.lease_connection()?;
    drop(pool);

    assert!(wait_until(Duration::from_secs(5), || factory.closed() == 1));
    Ok(())
}
