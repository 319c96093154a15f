//! Pool lifecycle events.
//!
//! Every state transition in the pool emits an event on a broadcast channel.
//! This is the only visibility callers get into internally retried transient
//! conditions and into asynchronous faults on idle connections, which have no
//! waiting caller to report to.

use std::error::Error;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::registry::ConnectionId;

/// Number of events buffered per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A pool lifecycle event.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum PoolEvent {
    /// An acquirer found the pool saturated and entered the waiter queue.
    ConnectionRequestQueued,
    /// A queued acquirer received a connection handoff.
    ConnectionRequestDequeued,
    /// A new connection was established and added to the pool.
    ConnectionAddedToPool,
    /// A connection was removed from the pool and closed.
    ConnectionRemovedFromPool,
    /// A released connection was parked in the idle set.
    ConnectionIdle,
    /// An idle connection was handed out to an acquirer.
    IdleConnectionActivated,
    /// A connection was removed from the idle set during teardown.
    ConnectionRemovedFromIdlePool,
    /// Establishment hit a "database starting up" error and will be retried.
    WaitingForDatabaseToStart,
    /// A query hit a "read-only transaction" error and will be retried.
    QueryDeniedForReadOnlyTransaction,
    /// A connection faulted asynchronously or failed to close cleanly.
    ConnectionError {
        /// Identity of the connection the error is tagged with.
        id: ConnectionId,
        /// The driver error.
        error: Arc<dyn Error + Send + Sync>,
    },
}

/// Broadcast channel the pool emits [`PoolEvent`]s on.
///
/// Emission never blocks and never fails: with no subscribers the event is
/// simply dropped.
#[derive(Debug, Clone)]
pub(crate) struct EventChannel {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventChannel {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        tracing::trace!(?event, "pool event");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let channel = EventChannel::new();
        let mut rx = channel.subscribe();

        channel.emit(PoolEvent::ConnectionAddedToPool);
        channel.emit(PoolEvent::ConnectionIdle);

        assert!(matches!(
            rx.recv().await.unwrap(),
            PoolEvent::ConnectionAddedToPool
        ));
        assert!(matches!(rx.recv().await.unwrap(), PoolEvent::ConnectionIdle));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let channel = EventChannel::new();
        channel.emit(PoolEvent::ConnectionRequestQueued);
    }
}
