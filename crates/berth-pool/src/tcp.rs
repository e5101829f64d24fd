//! TCP connector — a ready-made factory and health checker for pooling raw
//! tokio TCP streams to one endpoint.
//!
//! # Architecture
//!
//! ```text
//! pool needs a connection
//!   → TcpConnector::connect()
//!     → TcpStream::connect (bounded by connect_timeout) → TcpConnection
//!
//! pool releases a connection
//!   → TcpProbeChecker::check()
//!     → TcpConnection::probe() → 1-byte peek with a short timeout
//! ```
//!
//! A [`TcpConnection`] fires its close signal when it is closed locally, when
//! a read observes EOF, or when any I/O on it fails. Its `is_active` also
//! peeks the idle socket without waiting, so a connection whose peer hung up
//! while it sat idle is skipped at checkout.

use std::net::SocketAddr;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::{CloseSignal, Connection};
use crate::factory::{ConnectFuture, ConnectionFactory};
use crate::health::{CheckFuture, HealthChecker};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_millis(10);

// ── TcpConnection ────────────────────────────────────────────────────

/// A pooled TCP stream. Sends and receives raw bytes, no protocol parsing.
pub struct TcpConnection {
    peer: SocketAddr,
    recv_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    signal: CloseSignal,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("active", &self.is_active())
            .finish()
    }
}

impl TcpConnection {
    pub fn new(stream: TcpStream, recv_timeout: Duration) -> anyhow::Result<Self> {
        let peer = stream.peer_addr().context("read peer address")?;
        Ok(Self {
            peer,
            recv_timeout,
            stream: Mutex::new(Some(stream)),
            signal: CloseSignal::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Write all of `data`. Closes the connection on failure.
    pub async fn send(&self, data: &[u8]) -> anyhow::Result<usize> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            bail!("connection to {} is closed", self.peer);
        };

        let result = tokio::select! {
            result = stream.write_all(data) => result,
            _ = self.signal.fired() => {
                guard.take();
                bail!("connection to {} closed during send", self.peer);
            }
        };
        if let Err(e) = result {
            self.shut(&mut guard);
            return Err(e).with_context(|| format!("tcp send to {}", self.peer));
        }
        Ok(data.len())
    }

    /// Read up to `max_bytes`. EOF or an I/O error closes the connection.
    pub async fn recv(&self, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            bail!("connection to {} is closed", self.peer);
        };

        let mut buf = vec![0u8; max_bytes];
        let read = tokio::select! {
            read = tokio::time::timeout(self.recv_timeout, stream.read(&mut buf)) => read,
            _ = self.signal.fired() => {
                guard.take();
                bail!("connection to {} closed during recv", self.peer);
            }
        };

        match read {
            Err(_) => bail!("tcp recv from {} timed out after {:?}", self.peer, self.recv_timeout),
            Ok(Ok(0)) if max_bytes > 0 => {
                debug!(peer = %self.peer, "peer closed connection");
                self.shut(&mut guard);
                bail!("connection closed by {}", self.peer);
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => {
                self.shut(&mut guard);
                Err(e).with_context(|| format!("tcp recv from {}", self.peer))
            }
        }
    }

    /// Liveness probe: peek one byte with a short timeout. Pending data or
    /// a timeout both mean alive; EOF or an error closes the connection.
    pub async fn probe(&self) -> bool {
        if self.signal.is_fired() {
            return false;
        }
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return false;
        };

        let mut peek_buf = [0u8; 1];
        match tokio::time::timeout(PROBE_TIMEOUT, stream.peek(&mut peek_buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {
                debug!(peer = %self.peer, "probe found connection dead");
                self.shut(&mut guard);
                false
            }
            Ok(Ok(_)) | Err(_) => true,
        }
    }

    /// Non-blocking EOF check. A stream busy in another operation counts as
    /// alive; that operation sees the hang-up itself.
    fn peer_hung_up(&self) -> bool {
        let Ok(guard) = self.stream.try_lock() else {
            return false;
        };
        let Some(stream) = guard.as_ref() else {
            return true;
        };
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let mut cx = TaskContext::from_waker(Waker::noop());
        matches!(
            stream.poll_peek(&mut cx, &mut buf),
            Poll::Ready(Ok(0)) | Poll::Ready(Err(_))
        )
    }

    fn shut(&self, stream: &mut Option<TcpStream>) {
        stream.take();
        self.signal.fire();
    }
}

impl Connection for TcpConnection {
    fn close_signal(&self) -> &CloseSignal {
        &self.signal
    }

    fn is_active(&self) -> bool {
        !self.signal.is_fired() && !self.peer_hung_up()
    }

    fn close(&self) {
        self.signal.fire();
        // A busy stream is dropped by the operation holding it once it
        // observes the signal.
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }
    }
}

// ── TcpConnector ─────────────────────────────────────────────────────

/// Factory producing [`TcpConnection`]s to a single endpoint.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
    recv_timeout: Duration,
    nodelay: bool,
}

impl TcpConnector {
    /// `address` is anything tokio can resolve, e.g. `"db.internal:5432"`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            nodelay: true,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl ConnectionFactory<TcpConnection> for TcpConnector {
    fn connect(&self) -> ConnectFuture<'_, TcpConnection> {
        Box::pin(async move {
            let stream =
                tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
                    .await
                    .with_context(|| {
                        format!(
                            "tcp connect to {} timed out after {:?}",
                            self.address, self.connect_timeout
                        )
                    })?
                    .with_context(|| format!("tcp connect to {}", self.address))?;

            if self.nodelay {
                let _ = stream.set_nodelay(true);
            }
            let conn = TcpConnection::new(stream, self.recv_timeout)?;
            debug!(address = %self.address, peer = %conn.peer_addr(), "established tcp connection");
            Ok(conn)
        })
    }
}

// ── TcpProbeChecker ──────────────────────────────────────────────────

/// Health checker that probes the socket instead of trusting the close
/// signal alone, so a peer that hung up while the connection sat on loan
/// is caught at release.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpProbeChecker;

impl HealthChecker<TcpConnection> for TcpProbeChecker {
    fn check<'a>(&'a self, conn: &'a TcpConnection) -> CheckFuture<'a> {
        Box::pin(async move { Ok(conn.probe().await) })
    }
}

// ── Tests ────────────────────────────────────────────────────────────
