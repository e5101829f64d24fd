//! Connection contract and pooled loans.
//!
//! The pool never looks inside a connection. It needs three things from
//! it: whether it is still active, a way to close it, and a one-shot
//! [`CloseSignal`] that fires once the connection is closed, whether the
//! pool, the holder or the remote peer closed it.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::pool::Command;

/// Pool-assigned identity of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity of a pool instance, used only to validate ownership on release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PoolId(pub(crate) u64);

/// One-shot close notification shared by a connection and its watchers.
///
/// Cloning shares the same signal. It transitions from open to fired
/// exactly once; later `fire` calls are no-ops.
#[derive(Clone, Debug)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the connection closed. Returns `true` only for the call that
    /// performed the transition.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn fired(&self) {
        self.watch().wait().await;
    }

    /// Receiver-only view of the signal. Holding it does not keep the
    /// signal's owner alive.
    pub fn watch(&self) -> CloseWatch {
        CloseWatch(self.tx.subscribe())
    }
}

/// Receiver half of a [`CloseSignal`].
#[derive(Debug)]
pub struct CloseWatch(watch::Receiver<bool>);

impl CloseWatch {
    /// Resolve once the signal fires or every [`CloseSignal`] clone is dropped.
    pub async fn wait(mut self) {
        let _ = self.0.wait_for(|closed| *closed).await;
    }
}

/// A connection that can be managed by a [`FixedPool`](crate::FixedPool).
///
/// Implementations own their transport and must fire
/// [`close_signal`](Connection::close_signal) when the transport goes
/// away, whichever side closes it.
pub trait Connection: Send + Sync + 'static {
    fn close_signal(&self) -> &CloseSignal;

    fn is_active(&self) -> bool {
        !self.close_signal().is_fired()
    }

    /// Begin closing the connection. Must be idempotent.
    fn close(&self) {
        self.close_signal().fire();
    }
}

/// A connection on loan from a pool.
///
/// Not clonable: handing it back through `release` ends the loan. A loan
/// that is dropped instead goes back to its own pool on its own.
pub struct PooledConnection<C> {
    id: ConnectionId,
    pool: PoolId,
    conn: Arc<C>,
    /// Route back to the owning pool; `None` once the pool has taken the
    /// loan back.
    home: Option<mpsc::WeakUnboundedSender<Command<C>>>,
}

impl<C: Connection> PooledConnection<C> {
    pub(crate) fn new(
        id: ConnectionId,
        pool: PoolId,
        conn: Arc<C>,
        home: mpsc::WeakUnboundedSender<Command<C>>,
    ) -> Self {
        Self {
            id,
            pool,
            conn,
            home: Some(home),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn pool(&self) -> PoolId {
        self.pool
    }

    /// Shared handle to the underlying connection. Outlives the loan.
    pub fn shared(&self) -> Arc<C> {
        Arc::clone(&self.conn)
    }

    /// End the loan without notifying the pool. Only the owning pool task
    /// calls this, when it takes the connection back itself.
    pub(crate) fn settle(mut self) -> ConnectionId {
        self.home = None;
        self.id
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(home) = self.home.take() else {
            return;
        };
        if let Some(commands) = home.upgrade() {
            let _ = commands.send(Command::Dropped { id: self.id });
        }
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pool", &self.pool.0)
            .finish_non_exhaustive()
    }
}
