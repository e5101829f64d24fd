//! Pool configuration — capacity, admission limit and timeout policy.
//!
//! `PoolConfig` is plain data, loadable from the `[pool]` table of a TOML
//! file. Every field has a default so partial tables are accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// What happens to a waiter whose acquire timeout elapses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// No timer is scheduled; the waiter waits until served or the pool closes.
    #[default]
    None,
    /// The waiter is removed from the queue and fails with `AcquireTimedOut`.
    Fail,
    /// The waiter stays queued and a connection is opened past the capacity gate.
    NewConnection,
}

impl std::fmt::Display for TimeoutAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutAction::None => write!(f, "none"),
            TimeoutAction::Fail => write!(f, "fail"),
            TimeoutAction::NewConnection => write!(f, "new_connection"),
        }
    }
}

/// Fate of surplus connections opened by [`TimeoutAction::NewConnection`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// A healthy connection released while more than `max_connections`
    /// exist, and no waiter is queued, is closed instead of kept idle.
    #[default]
    Shrink,
    /// Surplus connections are kept idle and keep serving acquires.
    Retain,
}

/// Configuration for a [`FixedPool`](crate::FixedPool).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on concurrently acquired connections (default: 10).
    pub max_connections: usize,
    /// Cap on queued waiters; `None` means unbounded (default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending_acquires: Option<usize>,
    /// Waiter deadline in milliseconds; 0 disables the timer (default: 0).
    pub acquire_timeout_ms: u64,
    /// Policy applied when a waiter's deadline elapses (default: none).
    pub timeout_action: TimeoutAction,
    /// Run the health checker on every release (default: true).
    pub health_check_on_release: bool,
    /// Hand out the most recently released idle connection first (default: true).
    pub lifo: bool,
    /// Fate of connections opened past capacity (default: shrink).
    pub overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_pending_acquires: None,
            acquire_timeout_ms: 0,
            timeout_action: TimeoutAction::None,
            health_check_on_release: true,
            lifo: true,
            overflow: OverflowPolicy::Shrink,
        }
    }
}

impl PoolConfig {
    /// Config with the given capacity and every other field at its default.
    pub fn with_capacity(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Self::default()
        }
    }

    /// Parse a config from a TOML document holding the pool table fields.
    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        let config: PoolConfig =
            toml::from_str(content).map_err(|e| PoolError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the pool cannot honour.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_pending_acquires == Some(0) {
            return Err(PoolError::Configuration(
                "max_pending_acquires must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective admission limit for the pending queue.
    pub fn pending_limit(&self) -> usize {
        self.max_pending_acquires.unwrap_or(usize::MAX)
    }

    /// Waiter deadline, or `None` when waiters wait indefinitely.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        if self.acquire_timeout_ms == 0 || self.timeout_action == TimeoutAction::None {
            None
        } else {
            Some(Duration::from_millis(self.acquire_timeout_ms))
        }
    }

    /// Builder method: bound the pending queue.
    pub fn with_max_pending(self, max_pending_acquires: usize) -> Self {
        Self {
            max_pending_acquires: Some(max_pending_acquires),
            ..self
        }
    }

    /// Builder method: set the waiter deadline and what happens when it elapses.
    pub fn with_timeout(self, timeout: Duration, action: TimeoutAction) -> Self {
        Self {
            acquire_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            timeout_action: action,
            ..self
        }
    }

    /// Builder method: toggle the release-time health check.
    pub fn with_health_check_on_release(self, enabled: bool) -> Self {
        Self {
            health_check_on_release: enabled,
            ..self
        }
    }

    /// Builder method: hand out idle connections LIFO (`true`) or FIFO.
    pub fn with_lifo(self, lifo: bool) -> Self {
        Self { lifo, ..self }
    }

    /// Builder method: choose the overflow policy.
    pub fn with_overflow(self, overflow: OverflowPolicy) -> Self {
        Self { overflow, ..self }
    }
}
