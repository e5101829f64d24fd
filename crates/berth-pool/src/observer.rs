//! Pool event hooks.
//!
//! Observers run inside the pool's confinement context. An error returned
//! from a hook closes the connection involved and fails the acquire or
//! release that triggered it.

/// Notification hooks for connection lifecycle events.
pub trait PoolObserver<C>: Send + Sync {
    /// A new connection was produced by the factory.
    fn created(&self, _conn: &C) -> anyhow::Result<()> {
        Ok(())
    }

    /// A connection is about to be handed to a caller.
    fn acquired(&self, _conn: &C) -> anyhow::Result<()> {
        Ok(())
    }

    /// A caller handed a live connection back.
    fn released(&self, _conn: &C) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Observer that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl<C> PoolObserver<C> for NoopObserver {}
