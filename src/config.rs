use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SqlPoolError;
use crate::factory::ConnectionFactory;
use crate::jobs::JobRunner;
use crate::pool::SqlConnectionPool;

pub const DEFAULT_POOL_SIZE: usize = 25;
pub const DEFAULT_CONNECTION_LIFETIME: Duration = Duration::from_millis(300_000);
pub const DEFAULT_CONNECTION_BUSY_TIMEOUT: Duration = Duration::from_millis(21_600_000);
pub const DEFAULT_REAPER_START_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Options for a connection pool. Immutable once handed to
/// [`SqlConnectionPool::initialize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Used in log lines and in the reaper job's name.
    pub name: String,
    pub pool_size: usize,
    /// Maximum age of an idle connection, measured from its creation.
    #[serde(rename = "connection_lifetime_ms", with = "millis")]
    pub connection_lifetime: Duration,
    /// Maximum lease duration before the reaper takes the connection back.
    #[serde(rename = "connection_busy_timeout_ms", with = "millis")]
    pub connection_busy_timeout: Duration,
    #[serde(rename = "reaper_start_delay_ms", with = "millis")]
    pub reaper_start_delay: Duration,
    #[serde(rename = "reaper_interval_ms", with = "millis")]
    pub reaper_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            connection_lifetime: DEFAULT_CONNECTION_LIFETIME,
            connection_busy_timeout: DEFAULT_CONNECTION_BUSY_TIMEOUT,
            reaper_start_delay: DEFAULT_REAPER_START_DELAY,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn builder(name: impl Into<String>) -> PoolConfigBuilder {
        PoolConfigBuilder::new(name)
    }

    /// Check the invariants the pool relies on.
    ///
    /// # Errors
    /// Returns [`SqlPoolError::ConfigError`] for an empty name, a pool size of zero or a zero
    /// reaper interval.
    pub fn validate(&self) -> Result<(), SqlPoolError> {
        if self.name.trim().is_empty() {
            return Err(SqlPoolError::ConfigError("pool name must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(SqlPoolError::ConfigError(format!(
                "pool size of {} must be greater than 0",
                self.name
            )));
        }
        if self.reaper_interval.is_zero() {
            return Err(SqlPoolError::ConfigError(format!(
                "reaper interval of {} must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }

    /// Parse a JSON document; absent fields take their defaults.
    ///
    /// # Errors
    /// Returns [`SqlPoolError::ConfigError`] if the JSON is malformed or the result fails
    /// [`PoolConfig::validate`].
    pub fn from_json_str(content: &str) -> Result<Self, SqlPoolError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|err| SqlPoolError::ConfigError(format!("failed to parse pool config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    ///
    /// # Errors
    /// Returns [`SqlPoolError::ConfigError`] if the file cannot be read or does not parse.
    pub fn from_json_path(path: &Path) -> Result<Self, SqlPoolError> {
        let content = fs::read_to_string(path).map_err(|err| {
            SqlPoolError::ConfigError(format!(
                "failed to read pool config {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&content)
    }
}

/// Fluent builder for [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: PoolConfig::new(name),
        }
    }

    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.connection_lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn connection_busy_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_busy_timeout = timeout;
        self
    }

    /// When the first background sweep runs, and how long to wait between sweeps.
    #[must_use]
    pub fn reaper_schedule(mut self, start_delay: Duration, interval: Duration) -> Self {
        self.config.reaper_start_delay = start_delay;
        self.config.reaper_interval = interval;
        self
    }

    #[must_use]
    pub fn finish(self) -> PoolConfig {
        self.config
    }

    /// Create a pool for `factory` and initialize it with this configuration.
    ///
    /// # Errors
    /// Returns [`SqlPoolError::ConfigError`] if the configuration is invalid.
    pub fn build<F: ConnectionFactory>(
        self,
        factory: F,
        runner: JobRunner,
    ) -> Result<SqlConnectionPool<F>, SqlPoolError> {
        let pool = SqlConnectionPool::new(factory, runner);
        pool.initialize(self.finish())?;
        Ok(pool)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
