//! berth-pool — fixed-capacity, non-blocking connection pool.
//!
//! Bounds how many live connections to one remote endpoint may exist at
//! once, reuses idle connections, queues excess demand under an
//! admission limit and applies a timeout policy to waiters:
//! - **connection**: the `Connection` contract, `CloseSignal`, pooled loans
//! - **factory** / **health** / **observer**: external collaborators
//! - **config**: `PoolConfig` parsing and validation
//! - **pool**: the actor-confined state machine behind `FixedPool`
//! - **tcp**: a tokio TCP connector usable as a factory

pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod health;
pub mod observer;
pub mod pool;
pub mod tcp;

pub use config::{OverflowPolicy, PoolConfig, TimeoutAction};
pub use connection::{CloseSignal, CloseWatch, Connection, ConnectionId, PooledConnection};
pub use error::{PoolError, PoolResult};
pub use factory::{ConnectFuture, ConnectionFactory};
pub use health::{ActiveHealthChecker, CheckFuture, HealthChecker};
pub use observer::{NoopObserver, PoolObserver};
pub use pool::{FixedPool, PoolBuilder, PoolFuture, PoolStats};
