//! # pg-driver-pool
//!
//! Connection pool for PostgreSQL-style request/response drivers, with
//! transparent retry through two well-known transient cluster states.
//!
//! The pool multiplexes a bounded set of expensive, stateful connections
//! across many concurrent logical requests. It queues acquirers when
//! saturated (served FIFO via direct handoff from releases), evicts idle
//! connections after a timeout, and internally retries:
//!
//! - **establishment** while the server reports it is still starting up
//!   after a restart, and
//! - **queries** denied because the connection points at a server that
//!   became read-only during failover (idle connections are flushed, since
//!   they likely point at the same stale server).
//!
//! Both retry loops are bounded by a wall-clock budget anchored at the first
//! failure, not by an attempt counter.
//!
//! The wire protocol is not implemented here. A driver integrates by
//! implementing [`Manager`] and [`Connection`], including the predicates
//! that classify its structured errors; the pool never matches on error
//! text.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pg_driver_pool::{Pool, PoolConfig};
//!
//! let config = PoolConfig::new()
//!     .pool_size(10)
//!     .idle_timeout(Duration::from_secs(10));
//!
//! let pool = Pool::new(config, MyDriverManager::new(server))?;
//!
//! // One-shot query: acquire, execute, release on every exit path.
//! let rows = pool.query("SELECT now()", &[]).await?;
//!
//! // Or hold a connection across several statements.
//! let mut conn = pool.acquire().await?;
//! conn.query("SET search_path TO app", &[]).await?;
//! drop(conn); // returned to the pool
//!
//! pool.end();
//! ```
//!
//! ## Observability
//!
//! Every state transition emits a [`PoolEvent`] on a broadcast channel
//! ([`Pool::events`]). This is the only visibility into internally retried
//! transient conditions and into asynchronous faults on idle connections,
//! which have no waiting caller to report to.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod pool;
mod registry;

pub use config::{PoolConfig, RetryPolicy, ServerConfig};
pub use error::{ConfigError, PoolError};
pub use event::PoolEvent;
pub use manager::{Connection, Manager};
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use registry::ConnectionId;
