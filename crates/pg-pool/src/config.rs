//! Pool configuration.

use std::time::Duration;

/// Retry policy for one class of transient server state.
///
/// The pool understands two such classes: the server still starting up after
/// a restart, and queries denied because the connection points at a replica
/// that became read-only during failover. Each gets its own independent
/// policy.
///
/// The budget is wall-clock time measured from the *first* failure, not a
/// retry counter. A zero `retry_delay` with a non-zero budget is valid and
/// produces immediate re-attempts bounded only by elapsed time.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether this class of error is retried at all.
    pub enabled: bool,

    /// Delay inserted before each retry attempt.
    pub retry_delay: Duration,

    /// Total wall-clock budget from first failure before the original
    /// error is surfaced.
    pub total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_delay: Duration::ZERO,
            total_budget: Duration::from_secs(90),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable retries for this error class.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the delay inserted before each retry attempt.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the total wall-clock budget for retries.
    #[must_use]
    pub fn total_budget(mut self, budget: Duration) -> Self {
        self.total_budget = budget;
        self
    }

    /// A policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Where and how the underlying driver should connect.
///
/// The two shapes are mutually exclusive by construction. The pool itself
/// never interprets either one; it is handed to the driver integration that
/// implements [`Manager`](crate::manager::Manager).
#[derive(Debug, Clone)]
pub enum ServerConfig {
    /// Explicit host and credential set.
    Explicit {
        /// Server hostname or IP address.
        host: String,
        /// Server port (default: 5432).
        port: u16,
        /// Database name.
        database: String,
        /// User name, if not supplied by the environment.
        user: Option<String>,
        /// Password, if not supplied by the environment.
        password: Option<String>,
    },
    /// A single opaque connection string, parsed by the driver.
    ConnectionString(String),
}

impl ServerConfig {
    /// Explicit host/database shape with default port and no credentials.
    #[must_use]
    pub fn explicit(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self::Explicit {
            host: host.into(),
            port: 5432,
            database: database.into(),
            user: None,
            password: None,
        }
    }

    /// Connection-string shape.
    #[must_use]
    pub fn connection_string(conn_str: impl Into<String>) -> Self {
        Self::ConnectionString(conn_str.into())
    }

    /// Validate the configuration shape.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        match self {
            Self::Explicit { host, database, .. } => {
                if host.is_empty() {
                    return Err(crate::error::ConfigError("host must not be empty".into()));
                }
                if database.is_empty() {
                    return Err(crate::error::ConfigError(
                        "database must not be empty".into(),
                    ));
                }
                Ok(())
            }
            Self::ConnectionString(s) if s.is_empty() => Err(crate::error::ConfigError(
                "connection string must not be empty".into(),
            )),
            Self::ConnectionString(_) => Ok(()),
        }
    }
}

/// Configuration for the connection pool.
///
/// Immutable once the pool is constructed. Use the builder methods or
/// [`Default::default()`] to construct instances.
///
/// Server addressing is not part of this struct: construct your
/// [`Manager`](crate::manager::Manager) from a [`ServerConfig`], which the
/// pool itself never interprets.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections, counting both active and idle.
    pub pool_size: u32,

    /// Time a connection may sit idle before being evicted and closed.
    ///
    /// A zero duration disables idle parking entirely: released connections
    /// with no waiter are closed immediately.
    pub idle_timeout: Duration,

    /// Time an acquirer will wait in the queue for a connection handoff
    /// before failing with [`PoolError::AcquireTimeout`](crate::error::PoolError).
    pub acquire_timeout: Duration,

    /// Time allowed for a single connection establishment attempt.
    pub connect_timeout: Duration,

    /// Retry policy for "database starting up" establishment failures.
    pub startup_retry: RetryPolicy,

    /// Retry policy for "read-only transaction" query failures.
    pub read_only_retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            idle_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
            startup_retry: RetryPolicy::default(),
            read_only_retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the idle eviction timeout. Zero disables idle parking.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the queue wait timeout for acquirers.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the per-attempt connection establishment timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the retry policy for "database starting up" failures.
    #[must_use]
    pub fn startup_retry(mut self, policy: RetryPolicy) -> Self {
        self.startup_retry = policy;
        self
    }

    /// Set the retry policy for "read-only transaction" failures.
    #[must_use]
    pub fn read_only_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_only_retry = policy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.pool_size == 0 {
            return Err(crate::error::ConfigError(
                "pool_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.acquire_timeout, Duration::from_secs(90));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.startup_retry.enabled);
        assert!(config.read_only_retry.enabled);
        assert_eq!(config.startup_retry.retry_delay, Duration::ZERO);
        assert_eq!(config.startup_retry.total_budget, Duration::from_secs(90));
    }

    #[test]
    fn test_config_builder_methods() {
        let config = PoolConfig::new()
            .pool_size(3)
            .idle_timeout(Duration::from_secs(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_millis(250))
            .startup_retry(RetryPolicy::disabled())
            .read_only_retry(
                RetryPolicy::new()
                    .retry_delay(Duration::from_millis(10))
                    .total_budget(Duration::from_secs(2)),
            );

        assert_eq!(config.pool_size, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(1));
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert!(!config.startup_retry.enabled);
        assert!(config.read_only_retry.enabled);
        assert_eq!(config.read_only_retry.retry_delay, Duration::from_millis(10));
        assert_eq!(config.read_only_retry.total_budget, Duration::from_secs(2));
    }

    #[test]
    fn test_config_validation_zero_pool_size() {
        let mut config = PoolConfig::new();
        config.pool_size = 0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("pool_size must be greater than 0")
        );
    }

    #[test]
    fn test_server_config_shapes() {
        let explicit = ServerConfig::explicit("db.internal", "orders");
        assert!(explicit.validate().is_ok());

        let conn_str = ServerConfig::connection_string("postgres://app@db.internal/orders");
        assert!(conn_str.validate().is_ok());
    }

    #[test]
    fn test_server_config_rejects_empty_fields() {
        let empty_host = ServerConfig::explicit("", "orders");
        assert!(empty_host.validate().is_err());

        let empty_db = ServerConfig::explicit("db.internal", "");
        assert!(empty_db.validate().is_err());

        let empty_str = ServerConfig::connection_string("");
        assert!(empty_str.validate().is_err());
    }
}
