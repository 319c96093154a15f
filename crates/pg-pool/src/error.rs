//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Invalid pool or server configuration.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Errors surfaced to callers of pool operations.
///
/// Generic over the driver's error type so the original establishment or
/// query failure is carried as the source instead of being flattened into a
/// string.
///
/// Transient conditions (server starting up, read-only failover) are retried
/// inside the pool and only appear here, as [`Connect`](PoolError::Connect)
/// or [`Query`](PoolError::Query), once their retry budget is exhausted.
/// Asynchronous faults on live connections never reach a caller directly;
/// they are re-emitted on the pool's event channel.
#[derive(Debug, Error)]
pub enum PoolError<E> {
    /// Operation attempted after shutdown started.
    #[error("pool is closed")]
    Closed,

    /// No connection became available within the acquire timeout.
    #[error("timed out after {0:?} waiting for an available connection")]
    AcquireTimeout(Duration),

    /// Connection establishment exceeded the connect timeout.
    #[error("connection establishment timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Connection establishment failed.
    #[error("failed to establish connection: {0}")]
    Connect(#[source] E),

    /// Query execution failed.
    #[error("query failed: {0}")]
    Query(#[source] E),
}

impl<E> PoolError<E> {
    /// Get the underlying driver error, if this error carries one.
    pub fn as_driver_error(&self) -> Option<&E> {
        match self {
            Self::Connect(e) | Self::Query(e) => Some(e),
            _ => None,
        }
    }

    /// Unwrap into the underlying driver error, if this error carries one.
    pub fn into_driver_error(self) -> Option<E> {
        match self {
            Self::Connect(e) | Self::Query(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_error_messages() {
        let err: PoolError<Boom> = PoolError::Closed;
        assert_eq!(err.to_string(), "pool is closed");

        let err: PoolError<Boom> = PoolError::AcquireTimeout(Duration::from_secs(90));
        assert!(err.to_string().contains("90s"));

        let err: PoolError<Boom> = PoolError::Query(Boom);
        assert_eq!(err.to_string(), "query failed: boom");
    }

    #[test]
    fn test_driver_error_extraction() {
        let err: PoolError<Boom> = PoolError::Connect(Boom);
        assert!(err.as_driver_error().is_some());
        assert!(err.into_driver_error().is_some());

        let err: PoolError<Boom> = PoolError::Closed;
        assert!(err.as_driver_error().is_none());
        assert!(err.into_driver_error().is_none());
    }
}
