use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use sql_pool::test_utils::{MockFactory, wait_until};
use sql_pool::{JobScheduler, ManualClock, PoolConfig, SqlConnectionPool, SqlPoolError};

fn mock_pool(
    scheduler: &JobScheduler,
    clock: &ManualClock,
    config: PoolConfig,
) -> Result<(Arc<MockFactory>, SqlConnectionPool<MockFactory>), SqlPoolError> {
    let factory = Arc::new(MockFactory::new());
    let pool = SqlConnectionPool::with_clock(
        Arc::clone(&factory),
        scheduler.runner(),
        Arc::new(clock.clone()),
    );
    pool.initialize(config)?;
    Ok((factory, pool))
}

#[test]
fn released_connection_is_reused() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let clock = ManualClock::starting_now();
    let (factory, pool) = mock_pool(&scheduler, &clock, PoolConfig::new("reuse"))?;

    let first = pool.lease_connection()?;
    let first_id = first.with(|conn| conn.id())?;
    pool.release_connection(first)?;

    let second = pool.lease_connection()?;
    assert_eq!(second.with(|conn| conn.id())?, first_id);
    assert_eq!(factory.created(), 1);
    pool.release_connection(second)?;

    let stats = pool.stats();
    assert_eq!((stats.idle, stats.busy, stats.total_leases), (1, 0, 2));
    Ok(())
}

#[test]
fn idle_connections_are_handed_out_oldest_first() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let clock = ManualClock::starting_now();
    let (_factory, pool) = mock_pool(
        &scheduler,
        &clock,
        PoolConfig::builder("fifo").pool_size(3).finish(),
    )?;

    let leased: Vec<_> = (0..3)
        .map(|_| pool.lease_connection())
        .collect::<Result<_, _>>()?;
    let mut order = Vec::new();
    for conn in leased.into_iter().rev() {
        order.push(conn.id());
        pool.release_connection(conn)?;
    }

    let again: Vec<_> = (0..3)
        .map(|_| pool.lease_connection())
        .collect::<Result<_, _>>()?;
    let again_order: Vec<u64> = again.iter().map(|conn| conn.id()).collect();
    assert_eq!(again_order, order);
    for conn in again {
        pool.release_connection(conn)?;
    }
    Ok(())
}

/// Pool of two, both leased: a third lease blocks until one is released, then gets exactly
/// that connection.
#[test]
fn third_lease_waits_for_a_release() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let clock = ManualClock::starting_now();
    let (factory, pool) = mock_pool(
        &scheduler,
        &clock,
        PoolConfig::builder("scenario-a")
            .pool_size(2)
            .connection_lifetime(Duration::from_millis(1000))
            .connection_busy_timeout(Duration::from_millis(500))
            .finish(),
    )?;

    let first = pool.lease_connection()?;
    let second = pool.lease_connection()?;
    let released_id = first.id();

    thread::scope(|scope| -> Result<(), SqlPoolError> {
        let (tx, rx) = mpsc::channel();
        let pool = &pool;
        let waiter = scope.spawn(move || {
            let third = pool.lease_connection();
            let _ = tx.send(());
            third
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(150)).is_err(),
            "third lease must block while the pool is full"
        );
        pool.release_connection(first)?;

        let third = waiter
            .join()
            .map_err(|_| SqlPoolError::Other("waiter panicked".into()))??;
        assert_eq!(third.id(), released_id);
        pool.release_connection(third)?;
        Ok(())
    })?;

    pool.release_connection(second)?;
    assert_eq!(factory.created(), 2);
    Ok(())
}

#[test]
fn concurrent_leases_never_share_a_connection() -> Result<(), SqlPoolError> {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;
    const POOL_SIZE: usize = 3;

    let scheduler = JobScheduler::new()?;
    let clock = ManualClock::starting_now();
    let (factory, pool) = mock_pool(
        &scheduler,
        &clock,
        PoolConfig::builder("exclusive").pool_size(POOL_SIZE).finish(),
    )?;
    let in_use = Mutex::new(HashSet::new());
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let conn = pool.lease_connection().unwrap();
                    assert!(
                        in_use.lock().unwrap().insert(conn.id()),
                        "connection {} handed out twice",
                        conn.id()
                    );
                    assert!(pool.stats().total() <= POOL_SIZE);
                    conn.with(|raw| raw.execute("SELECT 1")).unwrap();
                    in_use.lock().unwrap().remove(&conn.id());
                    pool.release_connection(conn).unwrap();
                }
            });
        }
    });

    let stats = pool.stats();
    assert!(stats.total() <= POOL_SIZE);
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.total_leases, (THREADS * ROUNDS) as u64);
    assert!(factory.created() <= POOL_SIZE);
    Ok(())
}

#[test]
fn creation_failure_reaches_the_caller_without_using_capacity() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let clock = ManualClock::starting_now();
    let (factory, pool) = mock_pool(
        &scheduler,
        &clock,
        PoolConfig::builder("refused").pool_size(1).finish(),
    )?;

    factory.set_fail_create(true);
    let err = pool.lease_connection().unwrap_err();
    assert!(matches!(err, SqlPoolError::ConnectionError(_)));
    assert!(err.is_transient());
    assert_eq!(pool.stats().total(), 0);

    factory.set_fail_create(false);
    let conn = pool.lease_connection()?;
    pool.release_connection(conn)?;
    Ok(())
}

#[test]
fn failed_setup_closes_the_new_connection() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let clock = ManualClock::starting_now();
    let (factory, pool) = mock_pool(&scheduler, &clock, PoolConfig::new("setup"))?;

    factory.set_fail_after_create(true);
    assert!(matches!(
        pool.lease_connection(),
        Err(SqlPoolError::ConnectionError(_))
    ));
    assert!(wait_until(Duration::from_secs(5), || factory.is_closed(1)));
    assert_eq!(pool.stats().total(), 0);

    factory.set_fail_after_create(false);
    let conn = pool.lease_connection()?;
    assert_eq!(conn.with(|raw| raw.statements())?, 1, "setup ran on the new connection");
    pool.release_connection(conn)?;
    Ok(())
}

#[test]
fn pool_must_be_initialized_exactly_once() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let pool = SqlConnectionPool::new(MockFactory::new(), scheduler.runner());

    assert!(matches!(
        pool.lease_connection(),
        Err(SqlPoolError::NotInitialized)
    ));
    assert!(matches!(pool.manage_pool(), Err(SqlPoolError::NotInitialized)));
    assert!(matches!(
        pool.initialize(PoolConfig::builder("zero").pool_size(0).finish()),
        Err(SqlPoolError::ConfigError(_))
    ));

    pool.initialize(PoolConfig::new("once"))?;
    assert!(matches!(
        pool.initialize(PoolConfig::new("twice")),
        Err(SqlPoolError::AlreadyInitialized(_))
    ));
    assert_eq!(pool.name(), "once");
    Ok(())
}

#[test]
fn handles_from_another_pool_are_ignored() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let clock = ManualClock::starting_now();
    let (_, left) = mock_pool(&scheduler, &clock, PoolConfig::new("left"))?;
    let (_, right) = mock_pool(&scheduler, &clock, PoolConfig::new("right"))?;

    let conn = left.lease_connection()?;
    right.release_connection(conn)?;
    assert_eq!(left.stats().busy, 1);
    assert_eq!(right.stats().total(), 0);
    Ok(())
}

#[test]
fn inventory_and_with_connection() -> Result<(), SqlPoolError> {
    let scheduler = JobScheduler::new()?;
    let clock = ManualClock::starting_now();
    let (_, pool) = mock_pool(&scheduler, &clock, PoolConfig::new("report"))?;

    let statements = pool.with_connection(|conn| conn.execute("SELECT 1"))?;
    assert_eq!(statements, 2);
    let held = pool.lease_connection()?;
    let _second = pool.lease_connection()?;
    pool.release_connection(held)?;

    let inventory = pool.inventory();
    assert!(inventory.starts_with("Connection pool report\n"));
    assert!(inventory.contains("  total: 2\n"));
    assert!(inventory.contains("  busy:  1\n"));
    assert!(inventory.contains("  idle #1 MockConnection"));
    assert!(inventory.contains("  busy #2 MockConnection"));
    Ok(())
}
