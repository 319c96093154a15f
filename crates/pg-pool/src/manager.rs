//! Driver integration traits.
//!
//! The pool does not implement a wire protocol. It manages opaque connection
//! handles produced by a [`Manager`], each capable of establishment, query
//! execution, closure, and asynchronous fault reporting.
//!
//! Transient-state detection is part of the integration seam: the pool never
//! inspects error text, it asks the manager's predicates what a structured
//! driver error means. A driver that changes its error shapes updates its
//! manager, not the pool.

use std::error::Error;
use std::future::Future;

use tokio::sync::mpsc;

/// An opaque connection handle managed by the pool.
///
/// A handle is created unestablished, then driven through
/// [`establish`](Connection::establish) exactly once by the pool. At any
/// instant it is owned by exactly one of: a caller, the pool's idle set, or
/// an in-flight handoff to a queued acquirer.
pub trait Connection: Send + Sized + 'static {
    /// The driver's error type.
    type Error: Error + Send + Sync + 'static;

    /// The result of a successful query.
    type Rows: Send + 'static;

    /// The query parameter type.
    type Param: Send + Sync;

    /// Open the network session and authenticate.
    fn establish(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Execute one query on the established connection.
    fn query(
        &mut self,
        text: &str,
        params: &[Self::Param],
    ) -> impl Future<Output = Result<Self::Rows, Self::Error>> + Send;

    /// Close the network session.
    ///
    /// Called on eviction, fault, forced release, and pool shutdown. Must be
    /// safe to call on a half-open handle whose establishment was abandoned.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Take the channel on which the driver reports asynchronous faults
    /// (errors arising outside any in-flight operation, e.g. the server
    /// dropping the socket while the connection is idle).
    ///
    /// The pool takes this at most once, immediately after creating the
    /// handle. Drivers without out-of-band fault reporting return `None`.
    fn fault_stream(&mut self) -> Option<mpsc::UnboundedReceiver<Self::Error>>;
}

/// Factory for connection handles, plus the error predicates the pool's
/// retry and teardown logic consults.
///
/// Implementations are constructed from a
/// [`ServerConfig`](crate::config::ServerConfig) carrying the host or
/// connection-string shape the deployment was configured with; every handle
/// the factory produces targets that server.
pub trait Manager: Send + Sync + 'static {
    /// The connection handle type this manager produces.
    type Connection: Connection<Error = Self::Error>;

    /// The driver's error type.
    type Error: Error + Send + Sync + 'static;

    /// Instantiate a new, unestablished connection handle.
    fn create(&self) -> Self::Connection;

    /// Whether an establishment failure means the server is still starting
    /// up and the attempt is worth repeating.
    ///
    /// For PostgreSQL this is the `57P03` ("the database system is starting
    /// up") condition reported while a restarted server replays its WAL.
    fn is_startup_error(&self, error: &Self::Error) -> bool;

    /// Whether a query failure means the connection points at a server that
    /// became read-only, the signature of an in-progress failover.
    ///
    /// For PostgreSQL this is the `25006` ("cannot execute ... in a
    /// read-only transaction") condition.
    fn is_read_only_error(&self, error: &Self::Error) -> bool;

    /// Whether a close failure is the benign "peer already closed the
    /// socket" condition, which teardown ignores rather than reporting.
    fn is_benign_close_error(&self, error: &Self::Error) -> bool {
        false
    }
}
