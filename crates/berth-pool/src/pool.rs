//! Fixed-capacity pool handle.
//!
//! [`FixedPool`] is a cheap, clonable handle onto a pool task. Every
//! operation enqueues a command at call time and returns a [`PoolFuture`]
//! for its outcome; the caller never blocks on pool state. When the last
//! handle is dropped the pool closes every connection it still tracks.

mod pending;
mod registry;
mod state;
mod timeout;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::PoolConfig;
use crate::connection::{Connection, PoolId, PooledConnection};
use crate::error::{PoolError, PoolResult};
use crate::factory::ConnectionFactory;
use crate::health::{ActiveHealthChecker, HealthChecker};
use crate::observer::{NoopObserver, PoolObserver};

pub(crate) use state::Command;
use state::{Collaborators, PoolState};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot of pool accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    /// Capacity in use: connections on loan plus connects in flight.
    pub acquired: usize,
    pub idle: usize,
    /// Connections the pool is responsible for, idle or on loan.
    pub registered: usize,
    pub connecting: usize,
    /// Closed by the pool, close not yet confirmed by the connection.
    pub closing: usize,
    pub pending: usize,
    pub closed: bool,
    pub total_created: u64,
    pub total_timeouts: u64,
    pub total_rejected: u64,
}

impl PoolStats {
    /// `registered + connecting == idle + acquired`.
    pub fn is_consistent(&self) -> bool {
        self.registered + self.connecting == self.idle + self.acquired
    }
}

/// Outcome of a pool operation. Resolves exactly once.
///
/// Dropping it before it is polled to completion abandons the operation: an
/// abandoned acquire does not hold a pending slot, and any connection
/// produced for it goes back to the pool, even one already handed over.
#[must_use = "pool operations do nothing observable unless awaited"]
pub struct PoolFuture<T> {
    rx: oneshot::Receiver<PoolResult<T>>,
}

impl<T> PoolFuture<T> {
    fn ready(result: PoolResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<T> Future for PoolFuture<T> {
    type Output = PoolResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(PoolError::PoolClosed)))
    }
}

impl<T> std::fmt::Debug for PoolFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolFuture").finish_non_exhaustive()
    }
}

/// Fixed-capacity, non-blocking connection pool.
pub struct FixedPool<C: Connection> {
    commands: mpsc::UnboundedSender<Command<C>>,
    pool_id: PoolId,
}

impl<C: Connection> Clone for FixedPool<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            pool_id: self.pool_id,
        }
    }
}

impl<C: Connection> std::fmt::Debug for FixedPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedPool")
            .field("pool_id", &self.pool_id.0)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> FixedPool<C> {
    /// Pool with the default health checker and no observer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory<C>>) -> PoolResult<Self> {
        Self::builder(factory).with_config(config).build()
    }

    pub fn builder(factory: Arc<dyn ConnectionFactory<C>>) -> PoolBuilder<C> {
        PoolBuilder {
            config: PoolConfig::default(),
            factory,
            checker: None,
            observer: None,
        }
    }

    /// Obtain a connection: an idle one, a new one while under capacity,
    /// or a place in the pending queue.
    pub fn acquire(&self) -> PoolFuture<PooledConnection<C>> {
        self.dispatch(|reply| Command::Acquire { reply })
    }

    /// Return a loaned connection. Healthy connections go to the oldest
    /// waiter or back to idle; unhealthy ones are closed.
    ///
    /// A connection loaned by another pool is rejected with
    /// [`PoolError::ForeignConnection`] and returned to its own pool.
    pub fn release(&self, conn: PooledConnection<C>) -> PoolFuture<()> {
        if conn.pool() != self.pool_id {
            let id = conn.id();
            drop(conn);
            return PoolFuture::ready(Err(PoolError::ForeignConnection(id)));
        }
        self.dispatch(|reply| Command::Release { conn, reply })
    }

    /// Fail all waiters and close every connection. Resolves once every
    /// connection has confirmed its close. Idempotent.
    pub fn close(&self) -> PoolFuture<()> {
        self.dispatch(|reply| Command::Close { reply })
    }

    pub fn stats(&self) -> PoolFuture<PoolStats> {
        self.dispatch(|reply| Command::Stats { reply })
    }

    fn dispatch<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<PoolResult<T>>) -> Command<C>,
    ) -> PoolFuture<T> {
        let (tx, rx) = oneshot::channel();
        // A failed send drops `tx`, which resolves the future with `PoolClosed`.
        let _ = self.commands.send(command(tx));
        PoolFuture { rx }
    }
}

/// Builder for a [`FixedPool`] with custom collaborators.
pub struct PoolBuilder<C> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<C>>,
    checker: Option<Arc<dyn HealthChecker<C>>>,
    observer: Option<Arc<dyn PoolObserver<C>>>,
}

impl<C: Connection> PoolBuilder<C> {
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_health_checker(mut self, checker: Arc<dyn HealthChecker<C>>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PoolObserver<C>>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Validate the configuration and start the pool task on the current
    /// tokio runtime.
    pub fn build(self) -> PoolResult<FixedPool<C>> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PoolError::Configuration("a pool must be built inside a tokio runtime".to_string())
        })?;

        let pool_id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let checker: Arc<dyn HealthChecker<C>> = match self.checker {
            Some(checker) => checker,
            None => Arc::new(ActiveHealthChecker),
        };
        let observer: Arc<dyn PoolObserver<C>> = match self.observer {
            Some(observer) => observer,
            None => Arc::new(NoopObserver),
        };
        let collaborators = Collaborators {
            factory: self.factory,
            checker,
            observer,
        };
        let state = PoolState::new(pool_id, self.config, collaborators, tx.downgrade());
        runtime.spawn(state.run(rx));

        Ok(FixedPool {
            commands: tx,
            pool_id,
        })
    }
}
