//! Connection factory — the asynchronous connector the pool calls when it
//! needs a new connection.

use std::future::Future;
use std::pin::Pin;

/// Boxed future alias for connection factory results.
pub type ConnectFuture<'a, C> = Pin<Box<dyn Future<Output = anyhow::Result<C>> + Send + 'a>>;

/// Establishes new connections to the pool's endpoint.
///
/// Must not block. The pool calls it at most once per capacity reservation
/// and propagates any error verbatim to the waiting caller.
pub trait ConnectionFactory<C>: Send + Sync {
    fn connect(&self) -> ConnectFuture<'_, C>;
}
