//! Pool bookkeeping.
//!
//! One authoritative map from connection identity to a tagged slot state,
//! plus the idle order and the FIFO waiter queue. Everything here is plain
//! synchronous data guarded by the pool's mutex; no method suspends.
//!
//! Invariants:
//! - `total() <= pool_size` is enforced by [`Registry::reserve`], the only
//!   way a new identity enters the map.
//! - `idle_order` holds exactly the identities whose slot is [`Slot::Idle`].
//! - `waiters` holds exactly the identities present in `handoffs`; each is
//!   removed once, by the first of handoff or timeout.
//! - while `is_ending`, `reserve` refuses and callers tear down instead of
//!   parking.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Opaque identity of a pooled connection.
///
/// Assigned when a slot is reserved and stable across establishment retries
/// of that slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity of a queued acquirer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterId(u64);

/// Tagged state of one connection slot.
pub(crate) enum Slot<C> {
    /// Reserved; establishment in progress.
    Pending,
    /// Checked out by a caller, or in flight to a queued waiter.
    Active,
    /// Faulted while checked out; torn down on release instead of reused.
    Doomed,
    /// Parked in the idle set.
    Idle {
        conn: C,
        evict: Option<JoinHandle<()>>,
    },
}

/// Discriminant of [`Slot`], for callers that only need the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Pending,
    Active,
    Doomed,
    Idle,
}

/// Everything removed from the registry for one identity.
pub(crate) struct Removed<C> {
    pub conn: Option<C>,
    pub evict: Option<JoinHandle<()>>,
    pub monitor: Option<JoinHandle<()>>,
    pub was_idle: bool,
}

/// The pool's bookkeeping, owned exclusively behind the pool mutex.
///
/// `H` is the handoff payload sent to a queued acquirer. The pool sends a
/// self-releasing checkout guard, so a handoff that lands after the waiter's
/// future was dropped flows back into the pool instead of leaking the slot.
pub(crate) struct Registry<C, H> {
    slots: HashMap<ConnectionId, Slot<C>>,
    /// Idle identities, most recently idled last.
    idle_order: Vec<ConnectionId>,
    /// Queued acquirers, oldest first.
    waiters: VecDeque<WaiterId>,
    handoffs: HashMap<WaiterId, oneshot::Sender<H>>,
    /// Fault-monitor tasks by connection identity.
    monitors: HashMap<ConnectionId, JoinHandle<()>>,
    is_ending: bool,
    next_connection_id: u64,
    next_waiter_id: u64,
}

impl<C, H> Registry<C, H> {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
            idle_order: Vec::new(),
            waiters: VecDeque::new(),
            handoffs: HashMap::new(),
            monitors: HashMap::new(),
            is_ending: false,
            next_connection_id: 0,
            next_waiter_id: 0,
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle_order.len()
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_ending(&self) -> bool {
        self.is_ending
    }

    pub(crate) fn set_ending(&mut self) {
        self.is_ending = true;
    }

    pub(crate) fn kind(&self, id: ConnectionId) -> Option<SlotKind> {
        self.slots.get(&id).map(|slot| match slot {
            Slot::Pending => SlotKind::Pending,
            Slot::Active => SlotKind::Active,
            Slot::Doomed => SlotKind::Doomed,
            Slot::Idle { .. } => SlotKind::Idle,
        })
    }

    /// Reserve a slot for a new connection, if capacity allows and the pool
    /// is not shutting down.
    pub(crate) fn reserve(&mut self, pool_size: u32) -> Option<ConnectionId> {
        if self.is_ending || self.slots.len() >= pool_size as usize {
            return None;
        }
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        self.slots.insert(id, Slot::Pending);
        Some(id)
    }

    /// Move a reserved slot to active after successful establishment.
    ///
    /// A slot doomed by a fault during establishment stays doomed.
    pub(crate) fn activate(&mut self, id: ConnectionId) {
        if let Some(slot @ Slot::Pending) = self.slots.get_mut(&id) {
            *slot = Slot::Active;
        }
    }

    /// Mark a live slot to be torn down at release instead of reused.
    pub(crate) fn mark_doomed(&mut self, id: ConnectionId) {
        if let Some(slot @ (Slot::Pending | Slot::Active)) = self.slots.get_mut(&id) {
            *slot = Slot::Doomed;
        }
    }

    pub(crate) fn is_doomed(&self, id: ConnectionId) -> bool {
        matches!(self.slots.get(&id), Some(Slot::Doomed))
    }

    /// Pop the most recently idled connection, marking its slot active.
    pub(crate) fn pop_idle(&mut self) -> Option<(ConnectionId, C, Option<JoinHandle<()>>)> {
        let id = self.idle_order.pop()?;
        match self.slots.insert(id, Slot::Active) {
            Some(Slot::Idle { conn, evict }) => Some((id, conn, evict)),
            _ => {
                // idle_order and slots disagree; unreachable by construction
                debug_assert!(false, "idle order referenced a non-idle slot");
                None
            }
        }
    }

    /// Park an active connection in the idle set.
    pub(crate) fn park_idle(&mut self, id: ConnectionId, conn: C, evict: Option<JoinHandle<()>>) {
        debug_assert!(matches!(self.slots.get(&id), Some(Slot::Active)));
        self.slots.insert(id, Slot::Idle { conn, evict });
        self.idle_order.push(id);
    }

    /// Identities currently idle, oldest first.
    pub(crate) fn idle_ids(&self) -> Vec<ConnectionId> {
        self.idle_order.clone()
    }

    /// Register a queued acquirer with its one-shot handoff channel.
    pub(crate) fn enqueue_waiter(&mut self) -> (WaiterId, oneshot::Receiver<H>) {
        let id = WaiterId(self.next_waiter_id);
        self.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(id);
        self.handoffs.insert(id, tx);
        (id, rx)
    }

    /// Pop the oldest queued acquirer's handoff sender.
    pub(crate) fn pop_waiter(&mut self) -> Option<oneshot::Sender<H>> {
        while let Some(id) = self.waiters.pop_front() {
            if let Some(tx) = self.handoffs.remove(&id) {
                return Some(tx);
            }
        }
        None
    }

    /// Remove a waiter that timed out. Returns false if a concurrent release
    /// already claimed it for handoff.
    pub(crate) fn take_waiter(&mut self, id: WaiterId) -> bool {
        if self.handoffs.remove(&id).is_none() {
            return false;
        }
        self.waiters.retain(|w| *w != id);
        true
    }

    /// Install the fault-monitor task handle for a connection, returning any
    /// previous one so the caller can abort it.
    pub(crate) fn install_monitor(
        &mut self,
        id: ConnectionId,
        handle: JoinHandle<()>,
    ) -> Option<JoinHandle<()>> {
        self.monitors.insert(id, handle)
    }

    pub(crate) fn take_monitor(&mut self, id: ConnectionId) -> Option<JoinHandle<()>> {
        self.monitors.remove(&id)
    }

    /// Remove an identity from every set it appears in.
    ///
    /// Safe to call for identities already removed; callers may race.
    pub(crate) fn remove(&mut self, id: ConnectionId) -> Removed<C> {
        let monitor = self.monitors.remove(&id);
        let was_idle = self.idle_order.contains(&id);
        self.idle_order.retain(|i| *i != id);
        let (conn, evict) = match self.slots.remove(&id) {
            Some(Slot::Idle { conn, evict }) => (Some(conn), evict),
            _ => (None, None),
        };
        Removed {
            conn,
            evict,
            monitor,
            was_idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self, pool_size: u32) {
        assert!(self.slots.len() <= pool_size as usize);
        for id in &self.idle_order {
            assert!(matches!(self.slots.get(id), Some(Slot::Idle { .. })));
        }
        let idle_slots = self
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Idle { .. }))
            .count();
        assert_eq!(idle_slots, self.idle_order.len());
        assert_eq!(self.waiters.len(), self.handoffs.len());
        for w in &self.waiters {
            assert!(self.handoffs.contains_key(w));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    type Reg = Registry<&'static str, (ConnectionId, &'static str)>;

    #[test]
    fn test_reserve_respects_capacity() {
        let mut reg = Reg::new();
        let a = reg.reserve(2).unwrap();
        let b = reg.reserve(2).unwrap();
        assert_ne!(a, b);
        assert!(reg.reserve(2).is_none());
        assert_eq!(reg.total(), 2);
        reg.assert_invariants(2);
    }

    #[test]
    fn test_reserve_refused_while_ending() {
        let mut reg = Reg::new();
        reg.set_ending();
        assert!(reg.reserve(4).is_none());
    }

    #[test]
    fn test_idle_is_lifo() {
        let mut reg = Reg::new();
        let a = reg.reserve(4).unwrap();
        let b = reg.reserve(4).unwrap();
        reg.activate(a);
        reg.activate(b);
        reg.park_idle(a, "a", None);
        reg.park_idle(b, "b", None);
        reg.assert_invariants(4);

        let (id, conn, _) = reg.pop_idle().unwrap();
        assert_eq!(id, b);
        assert_eq!(conn, "b");
        let (id, conn, _) = reg.pop_idle().unwrap();
        assert_eq!(id, a);
        assert_eq!(conn, "a");
        assert!(reg.pop_idle().is_none());
        assert_eq!(reg.total(), 2);
        reg.assert_invariants(4);
    }

    #[test]
    fn test_waiters_are_fifo_and_serviced_once() {
        let mut reg = Reg::new();
        let (first, mut rx_first) = reg.enqueue_waiter();
        let (_second, _rx_second) = reg.enqueue_waiter();
        assert_eq!(reg.waiting_count(), 2);

        let id = reg.reserve(1).unwrap();
        let tx = reg.pop_waiter().unwrap();
        tx.send((id, "conn")).unwrap();
        assert_eq!(rx_first.try_recv().unwrap().1, "conn");

        // first was already claimed by the handoff; its timeout loses
        assert!(!reg.take_waiter(first));
        assert_eq!(reg.waiting_count(), 1);
        reg.assert_invariants(1);
    }

    #[test]
    fn test_waiter_timeout_removes_exactly_once() {
        let mut reg = Reg::new();
        let (w, _rx) = reg.enqueue_waiter();
        assert!(reg.take_waiter(w));
        assert!(!reg.take_waiter(w));
        assert_eq!(reg.waiting_count(), 0);
        assert!(reg.pop_waiter().is_none());
    }

    #[test]
    fn test_pop_waiter_skips_timed_out_entries() {
        let mut reg = Reg::new();
        let (w1, _rx1) = reg.enqueue_waiter();
        let (_w2, mut rx2) = reg.enqueue_waiter();
        assert!(reg.take_waiter(w1));

        let id = reg.reserve(1).unwrap();
        let tx = reg.pop_waiter().unwrap();
        tx.send((id, "conn")).unwrap();
        assert_eq!(rx2.try_recv().unwrap().1, "conn");
    }

    #[test]
    fn test_remove_is_idempotent_by_identity() {
        let mut reg = Reg::new();
        let id = reg.reserve(1).unwrap();
        reg.activate(id);
        reg.park_idle(id, "c", None);

        let removed = reg.remove(id);
        assert!(removed.was_idle);
        assert_eq!(removed.conn, Some("c"));

        let removed = reg.remove(id);
        assert!(!removed.was_idle);
        assert!(removed.conn.is_none());
        assert_eq!(reg.total(), 0);
        reg.assert_invariants(1);
    }

    #[test]
    fn test_doomed_slot_not_reactivated() {
        let mut reg = Reg::new();
        let id = reg.reserve(1).unwrap();
        reg.mark_doomed(id);
        reg.activate(id);
        assert!(reg.is_doomed(id));
        assert_eq!(reg.kind(id), Some(SlotKind::Doomed));
    }
}
