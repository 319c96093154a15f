//! Connection pool implementation.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
// budgets must follow the same clock as the timers they race, including
// under a paused test clock
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::{ConfigError, PoolError};
use crate::event::{EventChannel, PoolEvent};
use crate::manager::{Connection, Manager};
use crate::registry::{ConnectionId, Registry, SlotKind, WaiterId};

/// A connection pool for a request/response database protocol.
///
/// The pool multiplexes a bounded set of connections across concurrent
/// acquirers, queues acquirers when saturated, evicts idle connections, and
/// transparently retries through two transient server states: the database
/// still starting up after a restart, and queries denied because the
/// connection became read-only during failover.
///
/// Cloning the pool is cheap and clones share all state.
pub struct Pool<M: Manager> {
    shared: Arc<PoolShared<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("Pool")
            .field("total", &status.total)
            .field("idle", &status.idle)
            .field("waiting", &status.waiting)
            .field("max", &status.max)
            .finish()
    }
}

struct PoolShared<M: Manager> {
    config: PoolConfig,
    manager: M,
    registry: Mutex<Registry<M::Connection, PooledConnection<M>>>,
    events: EventChannel,
}

/// Point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Connections in the pool, active and idle.
    pub total: usize,
    /// Connections currently parked idle.
    pub idle: usize,
    /// Acquirers currently queued for a handoff.
    pub waiting: usize,
    /// Configured pool size limit.
    pub max: u32,
}

impl PoolStatus {
    /// Fraction of the pool currently checked out, as a percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.total - self.idle) as f64 / f64::from(self.max) * 100.0
    }
}

impl<M: Manager> Pool<M> {
    /// Create a new pool.
    ///
    /// No connections are opened until the first [`acquire`](Pool::acquire)
    /// or [`query`](Pool::query).
    pub fn new(config: PoolConfig, manager: M) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::info!(pool_size = config.pool_size, "connection pool created");
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                manager,
                registry: Mutex::new(Registry::new()),
                events: EventChannel::new(),
            }),
        })
    }

    /// Subscribe to the pool's lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Number of acquirers currently queued for a handoff.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.shared.registry.lock().waiting_count()
    }

    /// Number of connections currently parked idle.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.shared.registry.lock().idle_count()
    }

    /// Number of connections in the pool, active and idle.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.shared.registry.lock().total()
    }

    /// Whether [`end`](Pool::end) has been called.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.shared.registry.lock().is_ending()
    }

    /// Snapshot of current pool occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let reg = self.shared.registry.lock();
        PoolStatus {
            total: reg.total(),
            idle: reg.idle_count(),
            waiting: reg.waiting_count(),
            max: self.shared.config.pool_size,
        }
    }

    /// Acquire a connection from the pool.
    ///
    /// Serves the most recently idled connection without suspending when one
    /// exists; otherwise grows the pool if under its size limit; otherwise
    /// queues and waits for a released connection to be handed off, up to
    /// the configured acquire timeout.
    ///
    /// The returned [`PooledConnection`] releases itself back to the pool on
    /// drop.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError<M::Error>> {
        enum Plan<C, H> {
            Ready(ConnectionId, C),
            Create(ConnectionId),
            Wait(WaiterId, oneshot::Receiver<H>),
        }

        let shared = &self.shared;
        let plan = {
            let mut reg = shared.registry.lock();
            if reg.is_ending() {
                return Err(PoolError::Closed);
            }
            if let Some((id, conn, evict)) = reg.pop_idle() {
                if let Some(evict) = evict {
                    evict.abort();
                }
                shared.events.emit(PoolEvent::IdleConnectionActivated);
                tracing::trace!(%id, "idle connection activated");
                Plan::Ready(id, conn)
            } else if let Some(id) = reg.reserve(shared.config.pool_size) {
                Plan::Create(id)
            } else {
                let (waiter, rx) = reg.enqueue_waiter();
                shared.events.emit(PoolEvent::ConnectionRequestQueued);
                tracing::debug!(waiting = reg.waiting_count(), "pool saturated; acquirer queued");
                Plan::Wait(waiter, rx)
            }
        };

        match plan {
            Plan::Ready(id, conn) => Ok(PooledConnection::new(Arc::clone(shared), id, conn)),
            Plan::Create(id) => {
                // callers may race acquire against their own deadline, so the
                // reservation must survive this future being dropped
                let mut guard = ReservationGuard {
                    shared: Arc::clone(shared),
                    id,
                    armed: true,
                };
                match shared.create_connection(id).await {
                    Ok(conn) => {
                        let mut reg = shared.registry.lock();
                        guard.disarm();
                        if reg.is_ending() {
                            // shutdown began while establishment was in flight
                            shared.teardown_locked(&mut reg, id, Some(conn));
                            return Err(PoolError::Closed);
                        }
                        reg.activate(id);
                        drop(reg);
                        Ok(PooledConnection::new(Arc::clone(shared), id, conn))
                    }
                    // the guard releases the reservation and its monitor
                    Err(err) => Err(err),
                }
            }
            Plan::Wait(waiter, mut rx) => {
                let mut guard = WaiterGuard {
                    shared: Arc::clone(shared),
                    id: waiter,
                    armed: true,
                };
                let wait = shared.config.acquire_timeout;
                let sleep = tokio::time::sleep(wait);
                tokio::pin!(sleep);
                tokio::select! {
                    biased;
                    res = &mut rx => {
                        guard.disarm();
                        self.finish_handoff(res)
                    }
                    () = &mut sleep => {
                        let timed_out = shared.registry.lock().take_waiter(waiter);
                        guard.disarm();
                        if timed_out {
                            tracing::debug!("acquire timed out in waiter queue");
                            Err(PoolError::AcquireTimeout(wait))
                        } else {
                            // a release already claimed this waiter; the
                            // handoff is in flight and wins over the timeout
                            self.finish_handoff(rx.await)
                        }
                    }
                }
            }
        }
    }

    fn finish_handoff(
        &self,
        res: Result<PooledConnection<M>, oneshot::error::RecvError>,
    ) -> Result<PooledConnection<M>, PoolError<M::Error>> {
        match res {
            Ok(client) => {
                self.shared.events.emit(PoolEvent::ConnectionRequestDequeued);
                tracing::trace!(id = %client.id(), "handoff received");
                Ok(client)
            }
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// Execute one query on a pooled connection.
    ///
    /// Acquires a connection, runs the query, and releases the connection on
    /// every exit path. A failure matching the manager's read-only predicate
    /// is treated as a failover signal: the triggering connection is torn
    /// down, all idle connections are flushed (they likely point at the same
    /// now-read-only server), and the whole operation is re-run until the
    /// read-only retry budget elapses, after which the first such error is
    /// surfaced. Any other failure is surfaced immediately.
    pub async fn query(
        &self,
        text: &str,
        params: &[<M::Connection as Connection>::Param],
    ) -> Result<<M::Connection as Connection>::Rows, PoolError<M::Error>> {
        let policy = self.shared.config.read_only_retry.clone();
        let mut first_failure: Option<(Instant, M::Error)> = None;
        loop {
            let mut client = self.acquire().await?;
            let result = client.query(text, params).await;
            match result {
                Ok(rows) => {
                    client.release(false);
                    return Ok(rows);
                }
                Err(error) if policy.enabled && self.shared.manager.is_read_only_error(&error) => {
                    // the trigger connection is suspect; do not reuse it
                    client.release(true);
                    self.shared
                        .events
                        .emit(PoolEvent::QueryDeniedForReadOnlyTransaction);
                    tracing::warn!(
                        %error,
                        "query denied by read-only server; flushing idle connections and retrying"
                    );
                    self.shared.flush_idle();

                    let anchor = match first_failure.take() {
                        None => (Instant::now(), error),
                        Some(anchor) => anchor,
                    };
                    if anchor.0.elapsed() > policy.total_budget {
                        return Err(PoolError::Query(anchor.1));
                    }
                    first_failure = Some(anchor);
                    tokio::time::sleep(policy.retry_delay).await;
                }
                Err(error) => {
                    client.release(false);
                    return Err(PoolError::Query(error));
                }
            }
        }
    }

    /// Shut the pool down.
    ///
    /// Subsequent acquisitions fail with [`PoolError::Closed`]. Every idle
    /// connection is torn down now; checked-out connections are torn down
    /// individually as they are released. Does not wait for checked-out
    /// connections to drain. Idempotent.
    pub fn end(&self) {
        let mut reg = self.shared.registry.lock();
        if reg.is_ending() {
            return;
        }
        reg.set_ending();
        tracing::info!("connection pool shutting down");
        for id in reg.idle_ids() {
            self.shared.teardown_locked(&mut reg, id, None);
        }
    }
}

impl<M: Manager> PoolShared<M> {
    /// Establish a connection for a reserved slot.
    ///
    /// Retries through "database starting up" failures on a wall-clock
    /// budget anchored at the first failure, reusing the same identity so
    /// the total count is never double-incremented.
    async fn create_connection(
        self: &Arc<Self>,
        id: ConnectionId,
    ) -> Result<M::Connection, PoolError<M::Error>> {
        let policy = &self.config.startup_retry;
        let connect_timeout = self.config.connect_timeout;
        let mut first_failure: Option<(Instant, M::Error)> = None;
        loop {
            let mut conn = self.manager.create();
            if let Some(faults) = conn.fault_stream() {
                let handle = tokio::spawn(monitor_faults(Arc::downgrade(self), id, faults));
                if let Some(old) = self.registry.lock().install_monitor(id, handle) {
                    old.abort();
                }
            }

            match tokio::time::timeout(connect_timeout, conn.establish()).await {
                Ok(Ok(())) => {
                    self.events.emit(PoolEvent::ConnectionAddedToPool);
                    tracing::debug!(%id, "connection established");
                    return Ok(conn);
                }
                Err(_elapsed) => {
                    self.abort_monitor(id);
                    tracing::warn!(%id, ?connect_timeout, "connection establishment timed out");
                    // the handle is half-open; close it best-effort
                    self.spawn_close(id, conn);
                    return Err(PoolError::ConnectTimeout(connect_timeout));
                }
                Ok(Err(error)) if policy.enabled && self.manager.is_startup_error(&error) => {
                    self.abort_monitor(id);
                    // the failed attempt may still hold a half-open session
                    self.spawn_close(id, conn);
                    self.events.emit(PoolEvent::WaitingForDatabaseToStart);
                    tracing::warn!(%id, %error, "database starting up; retrying establishment");

                    let anchor = match first_failure.take() {
                        None => (Instant::now(), error),
                        Some(anchor) => anchor,
                    };
                    if anchor.0.elapsed() > policy.total_budget {
                        return Err(PoolError::Connect(anchor.1));
                    }
                    first_failure = Some(anchor);
                    tokio::time::sleep(policy.retry_delay).await;
                }
                Ok(Err(error)) => {
                    self.abort_monitor(id);
                    self.spawn_close(id, conn);
                    return Err(PoolError::Connect(error));
                }
            }
        }
    }

    fn abort_monitor(&self, id: ConnectionId) {
        if let Some(monitor) = self.registry.lock().take_monitor(id) {
            monitor.abort();
        }
    }

    /// Return a connection to the pool.
    ///
    /// Synchronous from the releaser's point of view; any teardown I/O is
    /// spawned, not awaited. A released connection under backlog is handed
    /// directly to the oldest live waiter and never goes idle.
    fn release(self: &Arc<Self>, id: ConnectionId, conn: M::Connection, force_remove: bool) {
        let mut reg = self.registry.lock();
        tracing::trace!(%id, force_remove, "connection released");

        if reg.is_ending() || force_remove || reg.is_doomed(id) {
            self.teardown_locked(&mut reg, id, Some(conn));
            return;
        }

        let mut conn = conn;
        while let Some(tx) = reg.pop_waiter() {
            // the payload is a full checkout guard: if the waiter's future is
            // dropped before it receives, the guard's own drop re-releases
            // the connection instead of stranding the slot
            let client = PooledConnection::new(Arc::clone(self), id, conn);
            match tx.send(client) {
                Ok(()) => {
                    tracing::debug!(%id, "connection handed off to queued acquirer");
                    return;
                }
                // that acquirer's future was already dropped; reclaim without
                // running the drop hook (we hold the registry lock) and try
                // the next one
                Err(back) => conn = back.into_conn(),
            }
        }

        if self.config.idle_timeout > Duration::ZERO {
            let evict = self.spawn_evict_timer(id);
            reg.park_idle(id, conn, evict);
            self.events.emit(PoolEvent::ConnectionIdle);
            tracing::trace!(%id, "connection parked idle");
        } else {
            self.teardown_locked(&mut reg, id, Some(conn));
        }
    }

    /// Tear down every idle connection.
    fn flush_idle(self: &Arc<Self>) {
        let mut reg = self.registry.lock();
        for id in reg.idle_ids() {
            self.teardown_locked(&mut reg, id, None);
        }
    }

    /// Remove a connection from all registry sets and close it.
    ///
    /// Idempotent by identity. Pass `conn` when the caller owns the handle;
    /// leave it `None` when the handle is parked in the registry.
    fn teardown_locked(
        self: &Arc<Self>,
        reg: &mut Registry<M::Connection, PooledConnection<M>>,
        id: ConnectionId,
        conn: Option<M::Connection>,
    ) {
        let removed = reg.remove(id);
        // detach the fault observer before closing so a close-triggered
        // error does not feed back into teardown
        if let Some(monitor) = removed.monitor {
            monitor.abort();
        }
        if let Some(evict) = removed.evict {
            evict.abort();
        }
        if removed.was_idle {
            self.events.emit(PoolEvent::ConnectionRemovedFromIdlePool);
        }
        if let Some(conn) = conn.or(removed.conn) {
            self.spawn_close(id, conn);
        }
        self.events.emit(PoolEvent::ConnectionRemovedFromPool);
        tracing::debug!(%id, "connection removed from pool");
    }

    /// Close a connection without blocking the releaser.
    fn spawn_close(self: &Arc<Self>, id: ConnectionId, mut conn: M::Connection) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // released outside a runtime; dropping the handle closes the
            // underlying socket
            drop(conn);
            return;
        };
        let shared = Arc::clone(self);
        handle.spawn(async move {
            if let Err(error) = conn.close().await {
                if !shared.manager.is_benign_close_error(&error) {
                    tracing::warn!(%id, %error, "error closing connection");
                    shared.events.emit(PoolEvent::ConnectionError {
                        id,
                        error: Arc::new(error),
                    });
                }
            }
        });
    }

    /// Arm the idle-eviction timer for a parked connection.
    fn spawn_evict_timer(self: &Arc<Self>, id: ConnectionId) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let weak = Arc::downgrade(self);
        let idle_timeout = self.config.idle_timeout;
        Some(handle.spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let Some(shared) = weak.upgrade() else { return };
            let mut reg = shared.registry.lock();
            // the connection may have been activated while we slept
            if matches!(reg.kind(id), Some(SlotKind::Idle)) {
                tracing::debug!(%id, "idle timeout elapsed; evicting connection");
                shared.teardown_locked(&mut reg, id, None);
            }
        }))
    }
}

/// Releases a reserved slot if its acquisition future is dropped.
///
/// Establishment awaits network I/O, so the caller can cancel at any point
/// (racing `acquire` against its own deadline is common). Without this the
/// `Pending` slot would count against the pool size forever.
struct ReservationGuard<M: Manager> {
    shared: Arc<PoolShared<M>>,
    id: ConnectionId,
    armed: bool,
}

impl<M: Manager> ReservationGuard<M> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<M: Manager> Drop for ReservationGuard<M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut reg = self.shared.registry.lock();
        if let Some(monitor) = reg.take_monitor(self.id) {
            monitor.abort();
        }
        let _ = reg.remove(self.id);
        tracing::debug!(id = %self.id, "abandoned reservation released");
    }
}

/// Unregisters a queued acquirer whose future is dropped before it either
/// receives a handoff or times out, so `waiting_count` stays accurate and
/// releases skip straight past it.
struct WaiterGuard<M: Manager> {
    shared: Arc<PoolShared<M>>,
    id: WaiterId,
    armed: bool,
}

impl<M: Manager> WaiterGuard<M> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<M: Manager> Drop for WaiterGuard<M> {
    fn drop(&mut self) {
        if self.armed && self.shared.registry.lock().take_waiter(self.id) {
            tracing::trace!("abandoned acquirer left the waiter queue");
        }
    }
}

/// Observe asynchronous faults reported by a live connection.
///
/// One fault dooms the connection: idle connections are torn down on the
/// spot, checked-out connections are torn down when released. The fault is
/// re-emitted on the pool's event channel either way, since an idle
/// connection has no caller to report to.
async fn monitor_faults<M: Manager>(
    shared: Weak<PoolShared<M>>,
    id: ConnectionId,
    mut faults: mpsc::UnboundedReceiver<M::Error>,
) {
    if let Some(error) = faults.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        tracing::warn!(%id, %error, "asynchronous fault on pooled connection");
        shared.events.emit(PoolEvent::ConnectionError {
            id,
            error: Arc::new(error),
        });
        let mut reg = shared.registry.lock();
        match reg.kind(id) {
            Some(SlotKind::Idle) => shared.teardown_locked(&mut reg, id, None),
            Some(SlotKind::Active | SlotKind::Pending) => reg.mark_doomed(id),
            Some(SlotKind::Doomed) | None => {}
        }
    }
}

/// A connection checked out of the pool.
///
/// Dereferences to the underlying driver connection. Returned to the pool on
/// drop; use [`release`](PooledConnection::release) to control whether it is
/// reused or torn down.
pub struct PooledConnection<M: Manager> {
    shared: Arc<PoolShared<M>>,
    id: ConnectionId,
    conn: Option<M::Connection>,
}

impl<M: Manager> PooledConnection<M> {
    fn new(shared: Arc<PoolShared<M>>, id: ConnectionId, conn: M::Connection) -> Self {
        Self {
            shared,
            id,
            conn: Some(conn),
        }
    }

    /// Identity of this connection within the pool.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Release the connection back to the pool.
    ///
    /// With `force_remove` the connection is torn down instead of being
    /// handed off or parked idle.
    pub fn release(mut self, force_remove: bool) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(self.id, conn, force_remove);
        }
    }

    /// Defuse the drop hook and take the connection back.
    ///
    /// Used when a handoff bounces off a dropped receiver; the reclaiming
    /// release already holds the registry lock, so the drop hook must not
    /// run.
    #[allow(clippy::expect_used)]
    fn into_conn(mut self) -> M::Connection {
        self.conn.take().expect("connection present until release")
    }
}

impl<M: Manager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until release")
    }
}

impl<M: Manager> DerefMut for PooledConnection<M> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until release")
    }
}

impl<M: Manager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(self.id, conn, false);
        }
    }
}

impl<M: Manager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
