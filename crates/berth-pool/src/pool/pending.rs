//! Pending queue — FIFO of acquire requests waiting for capacity.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;

use super::timeout::Timer;
use crate::connection::PooledConnection;
use crate::error::{PoolError, PoolResult};

/// Reply channel for a single pool operation.
pub(crate) type Reply<T> = oneshot::Sender<PoolResult<T>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RequestId(pub(crate) u64);

/// Terminal state of an acquire request. The first transition out of
/// `Pending` wins; every later attempt is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestState {
    Pending,
    Fulfilled,
    TimedOut,
    Failed,
}

/// One outstanding `acquire` call.
pub(crate) struct AcquireRequest<C> {
    id: RequestId,
    reply: Reply<PooledConnection<C>>,
    timer: Option<Timer>,
    state: RequestState,
    /// A past-capacity connection was already opened for this request.
    overflow_opened: bool,
}

impl<C> AcquireRequest<C> {
    pub(crate) fn new(id: RequestId, reply: Reply<PooledConnection<C>>) -> Self {
        Self {
            id,
            reply,
            timer: None,
            state: RequestState::Pending,
            overflow_opened: false,
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn arm(&mut self, timer: Timer) {
        self.timer = Some(timer);
    }

    /// Cancel the deadline timer, if any. No-op if it already fired.
    pub(crate) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// The timer fired; it no longer needs cancelling.
    pub(crate) fn timer_fired(&mut self) {
        self.timer = None;
    }

    /// Marks the overflow connection as opened. Returns `false` if one
    /// already was.
    pub(crate) fn open_overflow(&mut self) -> bool {
        !std::mem::replace(&mut self.overflow_opened, true)
    }

    /// The caller dropped its future.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn settle(&mut self, to: RequestState) -> bool {
        if self.state != RequestState::Pending {
            return false;
        }
        self.state = to;
        self.disarm();
        true
    }

    /// Hand the connection to the caller. Gives it back if the caller is gone.
    pub(crate) fn fulfil(mut self, conn: PooledConnection<C>) -> Option<PooledConnection<C>> {
        if !self.settle(RequestState::Fulfilled) {
            return Some(conn);
        }
        self.reply.send(Ok(conn)).err().and_then(Result::ok)
    }

    pub(crate) fn time_out(mut self, after: Duration) {
        if self.settle(RequestState::TimedOut) {
            let _ = self.reply.send(Err(PoolError::AcquireTimedOut(after)));
        }
    }

    pub(crate) fn fail(mut self, err: PoolError) {
        if self.settle(RequestState::Failed) {
            let _ = self.reply.send(Err(err));
        }
    }
}

/// Bounded FIFO of waiting requests.
pub(crate) struct PendingQueue<C> {
    queue: VecDeque<AcquireRequest<C>>,
    limit: usize,
}

impl<C> PendingQueue<C> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit,
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Admission check. Abandoned waiters do not hold a slot.
    pub(crate) fn is_full(&mut self) -> bool {
        self.prune();
        self.queue.len() >= self.limit
    }

    pub(crate) fn push(&mut self, request: AcquireRequest<C>) {
        self.queue.push_back(request);
    }

    /// Oldest request whose caller is still waiting.
    pub(crate) fn pop_live(&mut self) -> Option<AcquireRequest<C>> {
        while let Some(mut request) = self.queue.pop_front() {
            if request.is_abandoned() {
                request.disarm();
                continue;
            }
            return Some(request);
        }
        None
    }

    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut AcquireRequest<C>> {
        self.queue.iter_mut().find(|request| request.id() == id)
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<AcquireRequest<C>> {
        let index = self.queue.iter().position(|request| request.id() == id)?;
        self.queue.remove(index)
    }

    pub(crate) fn drain(&mut self) -> Vec<AcquireRequest<C>> {
        self.queue.drain(..).collect()
    }

    fn prune(&mut self) {
        self.queue.retain_mut(|request| {
            if request.is_abandoned() {
                request.disarm();
                false
            } else {
                true
            }
        });
    }
}
