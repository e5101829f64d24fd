//! Release-time health checks.
//!
//! A released connection goes back to the idle queue only when its health
//! check resolves to `Ok(true)`. Errors count as unhealthy.

use std::future::Future;
use std::pin::Pin;

use crate::connection::Connection;

/// Boxed future alias for health check results.
pub type CheckFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + 'a>>;

/// Decides whether a connection may be reused.
pub trait HealthChecker<C>: Send + Sync {
    fn check<'a>(&'a self, conn: &'a C) -> CheckFuture<'a>;
}

/// Default checker: a connection is healthy while it reports itself active.
#[derive(Clone, Copy, Debug, Default)]
pub struct ActiveHealthChecker;

impl<C: Connection> HealthChecker<C> for ActiveHealthChecker {
    fn check<'a>(&'a self, conn: &'a C) -> CheckFuture<'a> {
        let active = conn.is_active();
        Box::pin(async move { Ok(active) })
    }
}
