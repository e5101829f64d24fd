//! Registry — every connection the pool is responsible for, idle or on loan.
//!
//! Also owns the idle queue and the acquired counter so that the two can
//! never drift apart from the registry. The counter tracks capacity
//! reservations: loaned connections plus connects in flight. At every
//! point between commands:
//!
//! ```text
//! registered + connecting == idle + acquired
//! ```
//!
//! Removal is the only place a loaned connection's count is given back, and
//! an entry can only be removed once, so reconciliation is exactly-once no
//! matter which path (release, health failure, peer close, shutdown) gets
//! there first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Idle,
    OnLoan,
    /// Released by its holder, health check in flight. Still counted.
    Checking,
}

struct Entry<C> {
    conn: Arc<C>,
    slot: Slot,
}

pub(crate) struct Registry<C> {
    entries: HashMap<ConnectionId, Entry<C>>,
    idle: VecDeque<ConnectionId>,
    /// Closed by the pool but close signal not yet observed.
    closing: HashMap<ConnectionId, Arc<C>>,
    acquired: usize,
    connecting: usize,
    lifo: bool,
}

impl<C: Connection> Registry<C> {
    pub(crate) fn new(lifo: bool) -> Self {
        Self {
            entries: HashMap::new(),
            idle: VecDeque::new(),
            closing: HashMap::new(),
            acquired: 0,
            connecting: 0,
            lifo,
        }
    }

    /// Reserve capacity for a connection that is about to be created.
    pub(crate) fn reserve(&mut self) {
        self.acquired += 1;
        self.connecting += 1;
    }

    /// Give back a reservation whose connect failed.
    pub(crate) fn cancel_reservation(&mut self) {
        self.acquired = self.acquired.saturating_sub(1);
        self.connecting = self.connecting.saturating_sub(1);
    }

    /// Register a freshly created connection against its reservation.
    /// It starts out on loan.
    pub(crate) fn admit(&mut self, id: ConnectionId, conn: Arc<C>) {
        self.connecting = self.connecting.saturating_sub(1);
        self.entries.insert(
            id,
            Entry {
                conn,
                slot: Slot::OnLoan,
            },
        );
    }

    /// Take the next idle connection and put it on loan.
    pub(crate) fn checkout_idle(&mut self) -> Option<ConnectionId> {
        let id = if self.lifo {
            self.idle.pop_back()
        } else {
            self.idle.pop_front()
        }?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.slot = Slot::OnLoan;
            self.acquired += 1;
        }
        Some(id)
    }

    /// Start the release of a loaned connection. `None` if the connection is
    /// no longer registered or not on loan.
    pub(crate) fn begin_check(&mut self, id: ConnectionId) -> Option<Arc<C>> {
        let entry = self.entries.get_mut(&id)?;
        if entry.slot != Slot::OnLoan {
            return None;
        }
        entry.slot = Slot::Checking;
        Some(Arc::clone(&entry.conn))
    }

    pub(crate) fn is_checking(&self, id: ConnectionId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|entry| entry.slot == Slot::Checking)
    }

    /// Put a counted connection back on the idle queue.
    pub(crate) fn check_in(&mut self, id: ConnectionId) -> bool {
        if !self.park(id) {
            return false;
        }
        self.idle.push_back(id);
        true
    }

    /// Undo a [`checkout_idle`](Self::checkout_idle): the connection goes
    /// back to the end of the idle queue it was taken from.
    pub(crate) fn put_back(&mut self, id: ConnectionId) -> bool {
        if !self.park(id) {
            return false;
        }
        if self.lifo {
            self.idle.push_back(id);
        } else {
            self.idle.push_front(id);
        }
        true
    }

    fn park(&mut self, id: ConnectionId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.slot == Slot::Idle {
            return false;
        }
        entry.slot = Slot::Idle;
        self.acquired = self.acquired.saturating_sub(1);
        true
    }

    /// Pass a released connection straight to another caller. The loan
    /// count is unchanged: the connection never became idle.
    pub(crate) fn hand_over(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.slot == Slot::Checking {
                entry.slot = Slot::OnLoan;
            }
        }
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<&Arc<C>> {
        self.entries.get(&id).map(|entry| &entry.conn)
    }

    /// Deregister and close a connection. It stays in the closing set until
    /// its close signal is observed.
    pub(crate) fn discard(&mut self, id: ConnectionId) -> Option<Arc<C>> {
        let conn = self.remove(id)?;
        conn.close();
        if !conn.close_signal().is_fired() {
            self.closing.insert(id, Arc::clone(&conn));
        }
        Some(conn)
    }

    /// Close listener hook. Returns `true` when the connection was still
    /// registered, i.e. it was closed from outside the pool.
    pub(crate) fn forget(&mut self, id: ConnectionId) -> bool {
        self.closing.remove(&id);
        self.remove(id).is_some()
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Arc<C>> {
        let entry = self.entries.remove(&id)?;
        match entry.slot {
            Slot::Idle => self.idle.retain(|idle| *idle != id),
            Slot::OnLoan | Slot::Checking => self.acquired = self.acquired.saturating_sub(1),
        }
        Some(entry.conn)
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.entries.keys().copied().collect()
    }

    /// No registered connection, no close outstanding, no connect in flight.
    pub(crate) fn is_drained(&self) -> bool {
        self.entries.is_empty() && self.closing.is_empty() && self.connecting == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired
    }

    pub(crate) fn connecting(&self) -> usize {
        self.connecting
    }

    pub(crate) fn closing_len(&self) -> usize {
        self.closing.len()
    }
}
