//! Pool state machine — the single task that owns all mutable pool state.
//!
//! Callers, connect tasks, health-check tasks, deadline timers and close
//! listeners all talk to it through one command channel, so no lock guards
//! the idle queue, the pending queue, the registry or the counters.
//!
//! ```text
//! acquire ─┐                          ┌─ factory.connect()   ─┐
//! release ─┼─► Command ─► PoolState ──┼─ checker.check()     ─┼─► Command (re-entry)
//! close   ─┘                          ├─ deadline timer       │
//!                                     └─ close listener      ─┘
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::PoolStats;
use super::pending::{AcquireRequest, PendingQueue, Reply, RequestId, RequestState};
use super::registry::Registry;
use super::timeout::{Expiry, TimeoutPolicy};
use crate::config::{OverflowPolicy, PoolConfig};
use crate::connection::{Connection, ConnectionId, PoolId, PooledConnection};
use crate::error::{PoolError, PoolResult};
use crate::factory::ConnectionFactory;
use crate::health::HealthChecker;
use crate::observer::PoolObserver;

/// Messages processed by the pool task.
pub(crate) enum Command<C> {
    Acquire {
        reply: Reply<PooledConnection<C>>,
    },
    Release {
        conn: PooledConnection<C>,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    Stats {
        reply: Reply<PoolStats>,
    },
    Connected {
        target: Target<C>,
        result: anyhow::Result<C>,
    },
    Checked {
        id: ConnectionId,
        healthy: bool,
        reply: Option<Reply<()>>,
    },
    TimedOut {
        request: RequestId,
    },
    Closed {
        id: ConnectionId,
    },
    /// A loan was dropped by its holder instead of being released.
    Dropped {
        id: ConnectionId,
    },
}

/// Who receives a connection once it has been created.
pub(crate) enum Target<C> {
    /// A request no longer in the pending queue.
    Owned(AcquireRequest<C>),
    /// A request still queued; used by the past-capacity path, where a
    /// release may serve the request before the connect completes.
    Queued(RequestId),
}

/// Collaborators handed to the pool task at construction.
pub(crate) struct Collaborators<C> {
    pub(crate) factory: Arc<dyn ConnectionFactory<C>>,
    pub(crate) checker: Arc<dyn HealthChecker<C>>,
    pub(crate) observer: Arc<dyn PoolObserver<C>>,
}

#[derive(Debug, Default)]
struct Counters {
    created: u64,
    timeouts: u64,
    rejected: u64,
}

pub(crate) struct PoolState<C: Connection> {
    pool_id: PoolId,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<C>>,
    checker: Arc<dyn HealthChecker<C>>,
    observer: Arc<dyn PoolObserver<C>>,
    registry: Registry<C>,
    pending: PendingQueue<C>,
    timeouts: TimeoutPolicy,
    /// Weak so that only live pool handles and in-flight work keep the task running.
    commands: mpsc::WeakUnboundedSender<Command<C>>,
    closed: bool,
    close_waiters: Vec<Reply<()>>,
    next_connection: u64,
    next_request: u64,
    counters: Counters,
}

impl<C: Connection> PoolState<C> {
    pub(crate) fn new(
        pool_id: PoolId,
        config: PoolConfig,
        collaborators: Collaborators<C>,
        commands: mpsc::WeakUnboundedSender<Command<C>>,
    ) -> Self {
        Self {
            pool_id,
            registry: Registry::new(config.lifo),
            pending: PendingQueue::new(config.pending_limit()),
            timeouts: TimeoutPolicy::from_config(&config),
            config,
            factory: collaborators.factory,
            checker: collaborators.checker,
            observer: collaborators.observer,
            commands,
            closed: false,
            close_waiters: Vec::new(),
            next_connection: 1,
            next_request: 1,
            counters: Counters::default(),
        }
    }

    /// Process commands until every sender is gone, then close whatever is
    /// still tracked.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<C>>) {
        info!(
            pool = self.pool_id.0,
            max_connections = self.config.max_connections,
            max_pending = ?self.config.max_pending_acquires,
            timeout_action = %self.config.timeout_action,
            "connection pool started"
        );

        while let Some(command) = rx.recv().await {
            self.handle(command);
        }

        if !self.closed {
            info!(pool = self.pool_id.0, "all pool handles dropped, closing pool");
        }
        self.shut_down();
        self.finish_close();
    }

    fn handle(&mut self, command: Command<C>) {
        match command {
            Command::Acquire { reply } => self.acquire(reply),
            Command::Release { conn, reply } => self.release(conn, reply),
            Command::Close { reply } => self.close(reply),
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.stats()));
            }
            Command::Connected { target, result } => self.connected(target, result),
            Command::Checked { id, healthy, reply } => self.checked(id, healthy, reply),
            Command::TimedOut { request } => self.timed_out(request),
            Command::Closed { id } => {
                if self.registry.forget(id) {
                    debug!(connection = %id, "connection closed outside the pool, deregistered");
                }
            }
            Command::Dropped { id } => {
                debug!(connection = %id, "loan dropped without release, taking it back");
                self.take_back(id, None);
            }
        }

        self.serve_pending();
        if self.closed && self.registry.is_drained() {
            self.finish_close();
        }
    }

    // ── Acquire ──────────────────────────────────────────────────────

    fn acquire(&mut self, reply: Reply<PooledConnection<C>>) {
        if self.closed {
            let _ = reply.send(Err(PoolError::PoolClosed));
            return;
        }

        let request = AcquireRequest::new(self.next_request_id(), reply);

        if let Some(id) = self.checkout_idle() {
            debug!(connection = %id, "reused idle connection");
            self.deliver(request, id);
            return;
        }

        if self.registry.acquired() < self.config.max_connections {
            self.open(Target::Owned(request));
            return;
        }

        if self.pending.is_full() {
            self.counters.rejected += 1;
            debug!(
                pending = self.pending.len(),
                limit = self.pending.limit(),
                "pending queue full, rejecting acquire"
            );
            request.fail(PoolError::AdmissionRejected {
                pending: self.pending.len(),
                limit: self.pending.limit(),
            });
            return;
        }

        let mut request = request;
        let id = request.id();
        let commands = self.commands.clone();
        if let Some(timer) = self.timeouts.schedule(move || {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::TimedOut { request: id });
            }
        }) {
            debug!(deadline = ?timer.deadline(), "acquire deadline armed");
            request.arm(timer);
        }
        self.pending.push(request);
        debug!(
            pending = self.pending.len(),
            acquired = self.registry.acquired(),
            "pool at capacity, acquire queued"
        );
    }

    /// Next idle connection that still reports itself active. Stale ones
    /// are closed on the way.
    fn checkout_idle(&mut self) -> Option<ConnectionId> {
        while let Some(id) = self.registry.checkout_idle() {
            if self.registry.get(id).is_some_and(|conn| conn.is_active()) {
                return Some(id);
            }
            debug!(connection = %id, "discarding inactive idle connection");
            self.registry.discard(id);
        }
        None
    }

    /// Reserve capacity and create a connection for `target` in the background.
    fn open(&mut self, target: Target<C>) {
        let Some(commands) = self.commands.upgrade() else {
            self.fail_target(target, PoolError::PoolClosed);
            return;
        };
        self.registry.reserve();
        let factory = Arc::clone(&self.factory);
        tokio::spawn(async move {
            let result = factory.connect().await;
            let _ = commands.send(Command::Connected { target, result });
        });
    }

    fn connected(&mut self, target: Target<C>, result: anyhow::Result<C>) {
        let conn = match result {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                self.registry.cancel_reservation();
                warn!(error = %e, "connection attempt failed");
                self.fail_target(target, PoolError::Connect(e));
                return;
            }
        };

        let id = ConnectionId::new(self.next_connection);
        self.next_connection += 1;
        self.registry.admit(id, Arc::clone(&conn));
        self.counters.created += 1;
        self.install_close_listener(id, &conn);
        debug!(connection = %id, registered = self.registry.len(), "created new connection");

        if self.closed {
            self.registry.discard(id);
            self.fail_target(target, PoolError::PoolClosed);
            return;
        }
        if let Err(e) = self.observer.created(&conn) {
            warn!(connection = %id, error = %e, "observer rejected new connection");
            self.registry.discard(id);
            self.fail_target(target, PoolError::Observer(e));
            return;
        }

        match target {
            Target::Owned(request) => self.deliver(request, id),
            Target::Queued(request) => match self.pending.remove(request) {
                Some(request) => self.deliver(request, id),
                None => {
                    debug!(connection = %id, "waiter already served, recycling past-capacity connection");
                    self.recycle(id);
                }
            },
        }
    }

    /// One close listener per connection, installed at creation. It holds
    /// only the receiver side of the close signal and a weak command sender.
    fn install_close_listener(&self, id: ConnectionId, conn: &Arc<C>) {
        let watch = conn.close_signal().watch();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            watch.wait().await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Closed { id });
            }
        });
    }

    /// Hand a counted connection to a request, notifying the observer first.
    fn deliver(&mut self, request: AcquireRequest<C>, id: ConnectionId) {
        debug_assert_eq!(request.state(), RequestState::Pending);
        let Some(conn) = self.registry.get(id).cloned() else {
            request.fail(PoolError::PoolClosed);
            return;
        };
        if let Err(e) = self.observer.acquired(&conn) {
            warn!(connection = %id, error = %e, "observer rejected acquire, closing connection");
            self.registry.discard(id);
            request.fail(PoolError::Observer(e));
            return;
        }
        let pooled = PooledConnection::new(id, self.pool_id, conn, self.commands.clone());
        if let Some(pooled) = request.fulfil(pooled) {
            pooled.settle();
            debug!(connection = %id, "caller went away, recycling connection");
            self.recycle(id);
        }
    }

    fn fail_target(&mut self, target: Target<C>, err: PoolError) {
        match target {
            Target::Owned(request) => request.fail(err),
            Target::Queued(request) => {
                if let Some(request) = self.pending.remove(request) {
                    request.fail(err);
                }
            }
        }
    }

    // ── Release ──────────────────────────────────────────────────────

    /// Foreign loans never get here: the handle rejects them.
    fn release(&mut self, conn: PooledConnection<C>, reply: Reply<()>) {
        debug_assert_eq!(conn.pool(), self.pool_id);
        let id = conn.settle();
        self.take_back(id, Some(reply));
    }

    /// End a loan, released or dropped. `reply` is `None` for a dropped loan.
    fn take_back(&mut self, id: ConnectionId, reply: Option<Reply<()>>) {
        if self.closed {
            self.registry.discard(id);
            answer(reply, Ok(()));
            return;
        }

        let Some(conn) = self.registry.begin_check(id) else {
            debug!(connection = %id, "released connection already deregistered");
            answer(reply, Ok(()));
            return;
        };

        if !conn.is_active() {
            debug!(connection = %id, "released connection is closed, deregistering");
            self.registry.discard(id);
            answer(reply, Ok(()));
            return;
        }

        if let Err(e) = self.observer.released(&conn) {
            warn!(connection = %id, error = %e, "observer rejected release, closing connection");
            self.registry.discard(id);
            answer(reply, Err(PoolError::Observer(e)));
            return;
        }

        if !self.config.health_check_on_release {
            self.recycle(id);
            answer(reply, Ok(()));
            return;
        }

        let Some(commands) = self.commands.upgrade() else {
            self.registry.discard(id);
            answer(reply, Ok(()));
            return;
        };
        let checker = Arc::clone(&self.checker);
        tokio::spawn(async move {
            let healthy = match checker.check(&conn).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(connection = %id, error = %e, "health check errored, treating as unhealthy");
                    false
                }
            };
            let _ = commands.send(Command::Checked { id, healthy, reply });
        });
    }

    fn checked(&mut self, id: ConnectionId, healthy: bool, reply: Option<Reply<()>>) {
        // Closed or deregistered while the check ran; already reconciled.
        if !self.registry.is_checking(id) {
            answer(reply, Ok(()));
            return;
        }

        if healthy {
            self.recycle(id);
        } else {
            debug!(connection = %id, "connection failed health check, closing");
            self.registry.discard(id);
        }
        answer(reply, Ok(()));
    }

    /// Route a healthy counted connection to the oldest waiter, else back to
    /// idle. Surplus connections are closed under the shrink policy.
    fn recycle(&mut self, id: ConnectionId) {
        if let Some(request) = self.pending.pop_live() {
            self.registry.hand_over(id);
            debug!(connection = %id, "handing released connection to oldest waiter");
            self.deliver(request, id);
            return;
        }

        if self.config.overflow == OverflowPolicy::Shrink
            && self.registry.len() > self.config.max_connections
        {
            debug!(
                connection = %id,
                registered = self.registry.len(),
                max = self.config.max_connections,
                "closing surplus connection"
            );
            self.registry.discard(id);
            return;
        }

        self.registry.check_in(id);
        debug!(connection = %id, idle = self.registry.idle_len(), "returned connection to pool");
    }

    // ── Timeouts ─────────────────────────────────────────────────────

    fn timed_out(&mut self, id: RequestId) {
        // Already fulfilled or failed: the timer lost the race.
        let Some(request) = self.pending.get_mut(id) else {
            return;
        };

        match self.timeouts.on_expiry(request) {
            Expiry::Fail(after) => {
                if let Some(request) = self.pending.remove(id) {
                    self.counters.timeouts += 1;
                    debug!(timeout = ?after, "acquire timed out");
                    request.time_out(after);
                }
            }
            Expiry::OpenOverflow => {
                self.counters.timeouts += 1;
                debug!(
                    acquired = self.registry.acquired(),
                    max = self.config.max_connections,
                    "acquire timed out, opening connection past capacity"
                );
                self.open(Target::Queued(id));
            }
            Expiry::Ignore => {}
        }
    }

    // ── Capacity reconciliation ──────────────────────────────────────

    /// Serve the oldest waiters from idle connections, then from fresh
    /// connections while capacity remains.
    fn serve_pending(&mut self) {
        if self.closed {
            return;
        }
        while !self.pending.is_empty() {
            if let Some(id) = self.checkout_idle() {
                match self.pending.pop_live() {
                    Some(request) => self.deliver(request, id),
                    None => {
                        self.registry.put_back(id);
                        break;
                    }
                }
            } else if self.registry.acquired() < self.config.max_connections {
                match self.pending.pop_live() {
                    Some(mut request) => {
                        request.disarm();
                        self.open(Target::Owned(request));
                    }
                    None => break,
                }
            } else {
                break;
            }
        }
    }

    // ── Close ────────────────────────────────────────────────────────

    fn close(&mut self, reply: Reply<()>) {
        if self.closed {
            let _ = reply.send(Ok(()));
            return;
        }

        info!(
            pool = self.pool_id.0,
            registered = self.registry.len(),
            acquired = self.registry.acquired(),
            pending = self.pending.len(),
            "closing connection pool"
        );
        self.shut_down();
        self.close_waiters.push(reply);
    }

    /// Fail every waiter and force-close every tracked connection, idle or
    /// on loan.
    fn shut_down(&mut self) {
        self.closed = true;
        for request in self.pending.drain() {
            request.fail(PoolError::PoolClosed);
        }
        for id in self.registry.ids() {
            self.registry.discard(id);
        }
    }

    fn finish_close(&mut self) {
        if self.close_waiters.is_empty() {
            return;
        }
        info!(pool = self.pool_id.0, "connection pool closed");
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            max_connections: self.config.max_connections,
            acquired: self.registry.acquired(),
            idle: self.registry.idle_len(),
            registered: self.registry.len(),
            connecting: self.registry.connecting(),
            closing: self.registry.closing_len(),
            pending: self.pending.len(),
            closed: self.closed,
            total_created: self.counters.created,
            total_timeouts: self.counters.timeouts,
            total_rejected: self.counters.rejected,
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }
}

fn answer(reply: Option<Reply<()>>, result: PoolResult<()>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}
