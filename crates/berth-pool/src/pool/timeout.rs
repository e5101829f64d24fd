//! Timeout policy engine — per-request deadline timers and what a
//! deadline means under each [`TimeoutAction`].

use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::pending::AcquireRequest;
use crate::config::{PoolConfig, TimeoutAction};

/// Cancellable deadline timer attached to one pending request.
#[derive(Debug)]
pub(crate) struct Timer {
    deadline: Instant,
    handle: AbortHandle,
}

impl Timer {
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Idempotent; aborting a finished timer does nothing.
    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

/// Outcome of a deadline firing for a request that is still queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Expiry {
    /// Remove the request and fail it with `AcquireTimedOut`.
    Fail(Duration),
    /// Keep the request queued and open a connection past capacity for it.
    OpenOverflow,
    Ignore,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct TimeoutPolicy {
    timeout: Option<Duration>,
    action: TimeoutAction,
}

impl TimeoutPolicy {
    pub(crate) fn from_config(config: &PoolConfig) -> Self {
        Self {
            timeout: config.acquire_timeout(),
            action: config.timeout_action,
        }
    }

    /// Spawn a deadline timer that calls `fire` once it elapses. `None` when
    /// the policy schedules no timers.
    pub(crate) fn schedule<F>(&self, fire: F) -> Option<Timer>
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = self.timeout?;
        let deadline = Instant::now() + timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire();
        });
        Some(Timer {
            deadline,
            handle: task.abort_handle(),
        })
    }

    /// Decide what a fired deadline means for a request still pending.
    pub(crate) fn on_expiry<C>(&self, request: &mut AcquireRequest<C>) -> Expiry {
        request.timer_fired();
        let Some(timeout) = self.timeout else {
            return Expiry::Ignore;
        };
        match self.action {
            TimeoutAction::None => Expiry::Ignore,
            TimeoutAction::Fail => Expiry::Fail(timeout),
            TimeoutAction::NewConnection if request.open_overflow() => Expiry::OpenOverflow,
            TimeoutAction::NewConnection => Expiry::Ignore,
        }
    }
}
