//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by [`FixedPool`](crate::FixedPool) operations.
///
/// Admission and ownership failures are reported immediately and never
/// retried by the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("too many outstanding acquire operations ({pending}/{limit} pending)")]
    AdmissionRejected { pending: usize, limit: usize },

    #[error("acquire timed out after {0:?}")]
    AcquireTimedOut(Duration),

    #[error("connection {0} was not acquired from this pool")]
    ForeignConnection(ConnectionId),

    #[error("connection attempt failed: {0}")]
    Connect(#[source] anyhow::Error),

    #[error("pool observer failed: {0}")]
    Observer(#[source] anyhow::Error),

    #[error("pool is closed")]
    PoolClosed,

    #[error("invalid pool configuration: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Stable snake_case label, for grouping failures in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::AdmissionRejected { .. } => "admission_rejected",
            PoolError::AcquireTimedOut(_) => "acquire_timed_out",
            PoolError::ForeignConnection(_) => "foreign_connection",
            PoolError::Connect(_) => "connect",
            PoolError::Observer(_) => "observer",
            PoolError::PoolClosed => "pool_closed",
            PoolError::Configuration(_) => "configuration",
        }
    }
}
