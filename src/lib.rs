//! Bounded pool of blocking SQL connections.
//!
//! A [`SqlConnectionPool`] hands out connections made by a [`ConnectionFactory`], reuses
//! idle ones, caps the number of open connections, and sweeps out connections that lived too
//! long or were never given back. Closing always happens on a background [`JobRunner`].

pub mod clock;
pub mod config;
pub mod error;
pub mod factory;
pub mod jobs;
pub mod pool;
pub mod prelude;
pub mod service;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PoolConfig, PoolConfigBuilder};
pub use error::SqlPoolError;
pub use factory::{ConnectionFactory, Validity};
pub use jobs::{JobInput, JobRunner, JobScheduler};
pub use pool::{LeaseOptions, LeasedConnection, PoolStats, SqlConnectionPool, SweepOutcome};
pub use service::SqlService;

#[cfg(feature = "sqlite")]
pub use factory::sqlite::SqliteConnectionFactory;
