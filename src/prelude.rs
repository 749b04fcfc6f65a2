//! Convenient imports for common functionality.

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{PoolConfig, PoolConfigBuilder};
pub use crate::error::SqlPoolError;
pub use crate::factory::{ConnectionFactory, Validity};
pub use crate::jobs::{JobInput, JobRunner, JobScheduler};
pub use crate::pool::{LeaseOptions, LeasedConnection, PoolStats, SqlConnectionPool};
pub use crate::service::SqlService;

#[cfg(feature = "sqlite")]
pub use crate::factory::sqlite::SqliteConnectionFactory;

pub use tokio_util::sync::CancellationToken;
