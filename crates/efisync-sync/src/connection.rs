//! Connection Manager - reachability of the remote endpoint
//!
//! ```text
//!            probe ok              probe failed
//! Unknown ───────────→ Reachable ⇄ Unreachable
//!    └──────────────────────────────────↗ probe failed
//! ```
//!
//! A probe is a TCP connect-and-close bounded by a timeout. The last result
//! is cached for a TTL so [`ConnectionManager::is_reachable`] stays cheap.
//! State changes are published on a `watch` channel; the orchestrator turns
//! them into queue holds and drains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use efisync_core::{
    config::EndpointConfig,
    domain::{ErrorKind, TransferError},
    ports::{IReachabilityProbe, Reachability},
};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Probe outcomes kept for statistics
pub const PROBE_HISTORY: usize = 100;

// ============================================================================
// TcpProbe
// ============================================================================

/// Connects to the endpoint and immediately closes the connection
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait::async_trait]
impl IReachabilityProbe for TcpProbe {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<Duration, TransferError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(started.elapsed())
            }
            Ok(Err(e)) => Err(TransferError::io(format!("connect {address}"), &e)),
            Err(_) => Err(TransferError::new(
                ErrorKind::NetworkTimeout,
                format!("connect {address} timed out after {timeout:?}"),
            )),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ProbeRecord {
    latency: Option<Duration>,
}

/// Summary of recent probes, reported in status snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub endpoint: String,
    pub state: Reachability,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub avg_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub total_probes: u64,
    /// Share of successful probes in the retained history (0.0 - 1.0)
    pub success_rate: f64,
}

struct ProbeState {
    last: Option<(Instant, Result<Duration, ErrorKind>)>,
    last_at: Option<DateTime<Utc>>,
    history: VecDeque<ProbeRecord>,
    consecutive_failures: u32,
    total_probes: u64,
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Tracks reachability of one endpoint
pub struct ConnectionManager {
    address: String,
    timeout: Duration,
    ttl: Duration,
    probe: Arc<dyn IReachabilityProbe>,
    state: Mutex<ProbeState>,
    state_tx: watch::Sender<Reachability>,
}

impl ConnectionManager {
    pub fn new(endpoint: &EndpointConfig, probe: Arc<dyn IReachabilityProbe>) -> Self {
        let (state_tx, _) = watch::channel(Reachability::Unknown);
        Self {
            address: endpoint.address(),
            timeout: endpoint.probe_timeout(),
            ttl: endpoint.probe_ttl(),
            probe,
            state: Mutex::new(ProbeState {
                last: None,
                last_at: None,
                history: VecDeque::with_capacity(PROBE_HISTORY),
                consecutive_failures: 0,
                total_probes: 0,
            }),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.address
    }

    /// Current reachability state
    #[must_use]
    pub fn state(&self) -> Reachability {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.state_tx.subscribe()
    }

    /// Probe the endpoint now, bypassing the cache
    pub async fn probe(&self) -> Result<Duration, TransferError> {
        let result = self.probe.probe(&self.address, self.timeout).await;
        self.record(&result);
        result
    }

    /// Cached reachability; probes when the last result is older than the TTL
    pub async fn is_reachable(&self) -> bool {
        let cached = {
            let state = self.lock();
            state
                .last
                .as_ref()
                .filter(|(at, _)| at.elapsed() < self.ttl)
                .map(|(_, result)| result.is_ok())
        };
        match cached {
            Some(reachable) => reachable,
            None => self.probe().await.is_ok(),
        }
    }

    fn record(&self, result: &Result<Duration, TransferError>) {
        let next = {
            let mut state = self.lock();
            state.last = Some((Instant::now(), result.clone().map_err(|e| e.kind)));
            state.last_at = Some(Utc::now());
            state.total_probes += 1;
            if state.history.len() == PROBE_HISTORY {
                state.history.pop_front();
            }
            match result {
                Ok(latency) => {
                    state.consecutive_failures = 0;
                    state.history.push_back(ProbeRecord {
                        latency: Some(*latency),
                    });
                    Reachability::Reachable
                }
                Err(_) => {
                    state.consecutive_failures += 1;
                    state.history.push_back(ProbeRecord { latency: None });
                    Reachability::Unreachable
                }
            }
        };

        let previous = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if previous != next {
            match (next, result) {
                (Reachability::Reachable, Ok(latency)) => info!(
                    endpoint = %self.address,
                    from = %previous,
                    latency_ms = latency.as_millis() as u64,
                    "Endpoint reachable"
                ),
                (_, Err(e)) => warn!(
                    endpoint = %self.address,
                    from = %previous,
                    error_kind = %e.kind,
                    error = %e.message,
                    "Endpoint unreachable"
                ),
                _ => {}
            }
        } else {
            debug!(endpoint = %self.address, state = %next, "Probe complete");
        }
    }

    /// Statistics over the retained probe history
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        let state = self.lock();
        let latencies: Vec<Duration> = state.history.iter().filter_map(|r| r.latency).collect();
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            let total: Duration = latencies.iter().sum();
            Some((total / latencies.len() as u32).as_millis() as u64)
        };
        let success_rate = if state.history.is_empty() {
            0.0
        } else {
            latencies.len() as f64 / state.history.len() as f64
        };
        ConnectionStats {
            endpoint: self.address.clone(),
            state: self.state(),
            last_probe_at: state.last_at,
            last_latency_ms: state
                .last
                .as_ref()
                .and_then(|(_, r)| r.as_ref().ok())
                .map(|d| d.as_millis() as u64),
            avg_latency_ms,
            consecutive_failures: state.consecutive_failures,
            total_probes: state.total_probes,
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedProbe;
    use efisync_core::config::ConfigBuilder;
    use tokio::net::TcpListener;

    fn manager(probe: Arc<dyn IReachabilityProbe>, ttl_secs: u64) -> ConnectionManager {
        let cfg = ConfigBuilder::new()
            .endpoint("127.0.0.1", 7420)
            .endpoint_probe_ttl_secs(ttl_secs)
            .build();
        ConnectionManager::new(&cfg.endpoint, probe)
    }

    #[tokio::test]
    async fn test_state_machine_and_notifications() {
        let probe = Arc::new(ScriptedProbe::new(false));
        let mgr = manager(probe.clone(), 0);
        let mut rx = mgr.subscribe();
        assert_eq!(mgr.state(), Reachability::Unknown);

        assert!(mgr.probe().await.is_err());
        assert_eq!(mgr.state(), Reachability::Unreachable);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Reachability::Unreachable);

        // Same state again: no notification
        assert!(mgr.probe().await.is_err());
        assert!(!rx.has_changed().unwrap());

        probe.set_reachable(true);
        assert!(mgr.probe().await.is_ok());
        assert_eq!(*rx.borrow_and_update(), Reachability::Reachable);
    }

    #[tokio::test]
    async fn test_ttl_cache_avoids_probe() {
        let probe = Arc::new(ScriptedProbe::new(true));
        let mgr = manager(probe.clone(), 60);

        assert!(mgr.is_reachable().await);
        assert!(mgr.is_reachable().await);
        assert_eq!(probe.calls(), 1);

        // Cached value survives an endpoint flip until the TTL expires
        probe.set_reachable(false);
        assert!(mgr.is_reachable().await);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_probes() {
        let probe = Arc::new(ScriptedProbe::new(true));
        let mgr = manager(probe.clone(), 0);
        mgr.is_reachable().await;
        mgr.is_reachable().await;
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let probe = Arc::new(ScriptedProbe::new(false));
        let mgr = manager(probe.clone(), 0);
        for _ in 0..3 {
            let _ = mgr.probe().await;
        }
        let stats = mgr.stats();
        assert_eq!(stats.consecutive_failures, 3);
        assert_eq!(stats.total_probes, 3);
        assert_eq!(stats.avg_latency_ms, None);

        probe.set_reachable(true);
        let _ = mgr.probe().await;
        let stats = mgr.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.avg_latency_ms, Some(5));
        assert!((stats.success_rate - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let probe = Arc::new(ScriptedProbe::new(true));
        let mgr = manager(probe, 0);
        for _ in 0..(PROBE_HISTORY + 20) {
            let _ = mgr.probe().await;
        }
        assert_eq!(mgr.lock().history.len(), PROBE_HISTORY);
        assert_eq!(mgr.stats().total_probes, (PROBE_HISTORY + 20) as u64);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let latency = TcpProbe
            .probe(&addr, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(latency < Duration::from_secs(2));

        drop(listener);
        let err = TcpProbe
            .probe(&addr, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
