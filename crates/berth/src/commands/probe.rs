//! `berth probe` — drive concurrent acquire/send/recv/release cycles through
//! a `FixedPool` and report what the pool did.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Context;
use berth_pool::tcp::{TcpConnection, TcpProbeChecker};
use berth_pool::{FixedPool, PoolObserver, PoolStats};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BerthConfig;

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub workers: usize,
    pub iterations: usize,
    pub payload: String,
}

/// Counts pool lifecycle events.
#[derive(Debug, Default)]
struct ProbeObserver {
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PoolObserver<TcpConnection> for ProbeObserver {
    fn created(&self, conn: &TcpConnection) -> anyhow::Result<()> {
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %conn.peer_addr(), "probe connection created");
        Ok(())
    }

    fn acquired(&self, _conn: &TcpConnection) -> anyhow::Result<()> {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn released(&self, _conn: &TcpConnection) -> anyhow::Result<()> {
        self.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub address: String,
    pub workers: usize,
    pub iterations: usize,
    pub successes: u64,
    /// Failed cycles keyed by error kind.
    pub failures: BTreeMap<String, u64>,
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    pub elapsed_ms: u64,
    pub stats: PoolStats,
}

impl ProbeReport {
    pub fn failed(&self) -> u64 {
        self.failures.values().sum()
    }

    pub fn format_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("endpoint:     {}\n", self.address));
        out.push_str(&format!(
            "cycles:       {} ok, {} failed ({} workers x {} iterations) in {}ms\n",
            self.successes,
            self.failed(),
            self.workers,
            self.iterations,
            self.elapsed_ms
        ));
        for (kind, count) in &self.failures {
            out.push_str(&format!("  {kind}: {count}\n"));
        }
        out.push_str(&format!(
            "connections:  {} created, {} acquired, {} released\n",
            self.created, self.acquired, self.released
        ));
        out.push_str(&format!(
            "pool:         max {}, acquired {}, idle {}, registered {}, pending {}\n",
            self.stats.max_connections,
            self.stats.acquired,
            self.stats.idle,
            self.stats.registered,
            self.stats.pending
        ));
        out.push_str(&format!(
            "totals:       {} timeouts, {} rejected\n",
            self.stats.total_timeouts, self.stats.total_rejected
        ));
        out
    }
}

/// Outcome of one cycle: `Ok` or the failure kind.
type Cycle = Result<(), &'static str>;

async fn cycle(pool: &FixedPool<TcpConnection>, payload: &[u8]) -> Cycle {
    let conn = pool.acquire().await.map_err(|e| {
        debug!(error = %e, "acquire failed");
        e.kind()
    })?;

    let exchanged = async {
        conn.send(payload).await?;
        conn.recv(payload.len().max(1)).await
    }
    .await;

    let outcome = match exchanged {
        Ok(_) => Ok(()),
        Err(e) => {
            debug!(connection = %conn.id(), error = %e, "exchange failed");
            Err("io")
        }
    };

    pool.release(conn).await.map_err(|e| {
        warn!(error = %e, "release failed");
        e.kind()
    })?;
    outcome
}

pub async fn run(config: &BerthConfig, options: &ProbeOptions) -> anyhow::Result<ProbeReport> {
    let observer = Arc::new(ProbeObserver::default());
    let pool = FixedPool::<TcpConnection>::builder(Arc::new(config.endpoint.connector()))
        .with_config(config.pool.clone())
        .with_health_checker(Arc::new(TcpProbeChecker))
        .with_observer(observer.clone())
        .build()
        .context("failed to build pool")?;

    info!(
        address = %config.endpoint.address,
        workers = options.workers,
        iterations = options.iterations,
        "starting probe"
    );
    let started = Instant::now();

    let mut workers = Vec::with_capacity(options.workers);
    for _ in 0..options.workers {
        let pool = pool.clone();
        let payload = options.payload.clone().into_bytes();
        let iterations = options.iterations;
        workers.push(tokio::spawn(async move {
            let mut results = Vec::with_capacity(iterations);
            for _ in 0..iterations {
                results.push(cycle(&pool, &payload).await);
            }
            results
        }));
    }

    let mut successes: u64 = 0;
    let mut failures: BTreeMap<String, u64> = BTreeMap::new();
    for worker in workers {
        for result in worker.await.context("probe worker panicked")? {
            match result {
                Ok(()) => successes += 1,
                Err(kind) => *failures.entry(kind.to_string()).or_default() += 1,
            }
        }
    }
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let stats = pool.stats().await?;
    pool.close().await?;
    info!(successes, elapsed_ms, "probe finished");

    Ok(ProbeReport {
        address: config.endpoint.address.clone(),
        workers: options.workers,
        iterations: options.iterations,
        successes,
        failures,
        created: observer.created.load(Ordering::Relaxed),
        acquired: observer.acquired.load(Ordering::Relaxed),
        released: observer.released.load(Ordering::Relaxed),
        elapsed_ms,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use berth_pool::PoolConfig;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn start_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn config(address: String, max_connections: usize) -> BerthConfig {
        BerthConfig {
            endpoint: EndpointConfig {
                address,
                connect_timeout_ms: 1_000,
                recv_timeout_ms: 2_000,
                nodelay: true,
            },
            pool: PoolConfig::with_capacity(max_connections),
        }
    }

    fn options(workers: usize, iterations: usize) -> ProbeOptions {
        ProbeOptions {
            workers,
            iterations,
            payload: "ping".to_string(),
        }
    }

    #[tokio::test]
    async fn probe_against_echo_server() {
        let addr = start_echo_server().await;
        let report = run(&config(addr.to_string(), 2), &options(4, 5)).await.unwrap();

        assert_eq!(report.successes, 20);
        assert_eq!(report.failed(), 0);
        assert!(report.created >= 1 && report.created <= 2);
        assert_eq!(report.acquired, 20);
        assert_eq!(report.released, 20);
        assert!(report.stats.is_consistent());
        assert!(report.format_text().contains("20 ok, 0 failed"));
    }

    #[tokio::test]
    async fn probe_counts_connect_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let report = run(&config(addr.to_string(), 1), &options(1, 3)).await.unwrap();
        assert_eq!(report.successes, 0);
        assert_eq!(report.failures.get("connect"), Some(&3));
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn report_serializes_to_json() {
        let addr = start_echo_server().await;
        let report = run(&config(addr.to_string(), 1), &options(1, 1)).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["successes"], 1);
        assert_eq!(json["stats"]["max_connections"], 1);
    }
}
