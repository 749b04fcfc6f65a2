use std::sync::Arc;
use std::time::Duration;

use sql_pool::test_utils::{MockFactory, wait_until};
use sql_pool::{JobScheduler, ManualClock, PoolConfig, SqlConnectionPool, SqlPoolError};

/// Show the pool's log lines in failing test output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

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
    pool.initialize(PoolConfig::builder("dirty").pool_size(pool_size).finish())?;
    Ok((factory, pool))
}

#[test]
fn broken_idle_connection_is_never_handed_out() -> Result<(), SqlPoolError> {
    init_tracing();
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 2)?;

    let conn = pool.lease_connection()?;
    pool.release_connection(conn)?;
    factory.break_connection(1);

    let conn = pool.lease_connection()?;
    assert_eq!(conn.with(|raw| raw.id())?, 2);
    assert_eq!(factory.tests_run(), 3);
    assert!(wait_until(Duration::from_secs(5), || factory.is_closed(1)));
    assert_eq!(pool.stats().total(), 1);
    pool.release_connection(conn)?;
    Ok(())
}

#[test]
fn lease_skips_every_broken_candidate() -> Result<(), SqlPoolError> {
    init_tracing();
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 3)?;

    let held: Vec<_> = (0..3)
        .map(|_| pool.lease_connection())
        .collect::<Result<_, _>>()?;
    for conn in held {
        pool.release_connection(conn)?;
    }
    factory.break_connection(1);
    factory.break_connection(2);

    let conn = pool.lease_connection()?;
    assert_eq!(conn.id(), 3);
    assert!(wait_until(Duration::from_secs(5), || factory.closed() == 2));
    pool.release_connection(conn)?;
    Ok(())
}

/// Pool of three with two leases outstanding and one idle connection: releasing a connection
/// that fails its post-use check succeeds for the caller, and the pool shrinks to two.
#[test]
fn dirty_release_is_discarded_silently() -> Result<(), SqlPoolError> {
    init_tracing();
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 3)?;

    let warmup = pool.lease_connection()?;
    let first = pool.lease_connection()?;
    let second = pool.lease_connection()?;
    pool.release_connection(warmup)?;
    assert_eq!(pool.stats().total(), 3);

    let dirty_id = first.id();
    first.with(|raw| raw.execute("BEGIN"))?;
    pool.release_connection(first)?;

    let stats = pool.stats();
    assert_eq!((stats.total(), stats.idle, stats.busy), (2, 1, 1));
    assert!(wait_until(Duration::from_secs(5), || factory.is_closed(dirty_id)));

    pool.release_connection(second)?;
    assert_eq!(pool.stats().idle, 2);
    Ok(())
}

#[test]
fn close_failures_are_only_logged() -> Result<(), SqlPoolError> {
    init_tracing();
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 1)?;
    factory.set_fail_close(true);

    let conn = pool.lease_connection()?;
    conn.with(|raw| raw.execute("BEGIN"))?;
    pool.release_connection(conn)?;
    assert!(wait_until(Duration::from_secs(5), || factory.is_closed(1)));

    let conn = pool.lease_connection()?;
    assert_eq!(conn.id(), 2);
    pool.release_connection(conn)?;
    Ok(())
}

#[test]
fn slow_close_does_not_block_release() -> Result<(), SqlPoolError> {
    init_tracing();
    let scheduler = JobScheduler::new()?;
    let (factory, pool) = mock_pool(&scheduler, 1)?;
    factory.set_close_delay(Duration::from_millis(300));

    let conn = pool.lease_connection()?;
    conn.with(|raw| raw.execute("BEGIN"))?;
    let started = std::time::Instant::now();
    pool.release_connection(conn)?;
    let conn = pool.lease_connection()?;
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(!factory.is_closed(1));
    pool.release_connection(conn)?;

    assert!(wait_until(Duration::from_secs(5), || factory.is_closed(1)));
    Ok(())
}
