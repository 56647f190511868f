//! Tunnel Manager
//!
//! This module provides centralized tunnel management including:
//! - Admission limiting via semaphore-based backpressure
//! - Tracking of running tunnels and their close notifications
//! - Graceful shutdown with tunnel draining
//! - Statistics collection

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use super::stats::{AdapterStats, AdapterStatsSnapshot, StatsSnapshot, TunnelStats};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::socket::ProxySocket;
use crate::tunnel::{Tunnel, TunnelContext, TunnelReport};

/// Capacity of the close notification channel
const CLOSED_CHANNEL_CAPACITY: usize = 256;

/// A running tunnel
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub client: Option<SocketAddr>,
    pub opened_at: Instant,
}

/// Spawns tunnels and tracks them until they close
#[derive(Debug)]
pub struct TunnelManager {
    ctx: Arc<TunnelContext>,

    /// Admission cap, `None` for unlimited
    semaphore: Option<Arc<Semaphore>>,
    max_connections: Option<usize>,

    stats: Arc<TunnelStats>,
    adapter_stats: Arc<DashMap<String, AdapterStats>>,
    active: Arc<DashMap<u64, TunnelInfo>>,
    next_id: AtomicU64,

    /// Drain timeout for graceful shutdown
    drain_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    closed_tx: broadcast::Sender<Arc<TunnelReport>>,
    shutting_down: AtomicBool,
}

impl TunnelManager {
    #[must_use]
    pub fn new(config: &ConnectionConfig, ctx: Arc<TunnelContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (closed_tx, _) = broadcast::channel(CLOSED_CHANNEL_CAPACITY);

        Self {
            ctx,
            semaphore: config.max_connections.map(|max| Arc::new(Semaphore::new(max))),
            max_connections: config.max_connections,
            stats: Arc::new(TunnelStats::new()),
            adapter_stats: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            drain_timeout: config.drain_timeout(),
            shutdown_tx,
            closed_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Run a tunnel for an accepted proxy socket
    ///
    /// Returns the tunnel id. The proxy socket is dropped, closing its
    /// stream, when the tunnel is not admitted.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::ShuttingDown` after [`shutdown`](Self::shutdown)
    /// started and `ConnectionError::LimitReached` when the admission cap is
    /// exhausted.
    pub fn spawn_tunnel(
        &self,
        proxy: Box<dyn ProxySocket>,
        client: Option<SocketAddr>,
    ) -> Result<u64, ConnectionError> {
        if self.is_shutting_down() {
            return Err(ConnectionError::ShuttingDown);
        }

        let permit = match (&self.semaphore, self.max_connections) {
            (Some(semaphore), Some(max)) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats.record_rejected();
                    let current = max - semaphore.available_permits();
                    warn!(
                        "Connection limit reached ({}/{}), rejecting connection from {:?}",
                        current, max, client
                    );
                    return Err(ConnectionError::limit_reached(current, max));
                }
            },
            _ => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.record_accepted();
        self.active.insert(
            id,
            TunnelInfo {
                client,
                opened_at: Instant::now(),
            },
        );
        debug!(id, ?client, active = self.active.len(), "Tunnel admitted");

        let tunnel = Tunnel::new(id, client, proxy, Arc::clone(&self.ctx)).with_shutdown(self.shutdown_tx.subscribe());
        let stats = Arc::clone(&self.stats);
        let adapter_stats = Arc::clone(&self.adapter_stats);
        let active = Arc::clone(&self.active);
        let closed_tx = self.closed_tx.clone();

        tokio::spawn(async move {
            let report = tunnel.run().await;
            drop(permit);
            active.remove(&report.id);
            stats.record_closed(&report);
            if let Some(adapter) = report.adapter.as_ref() {
                adapter_stats.entry(adapter.clone()).or_default().record(&report);
            }
            // No subscribers is fine
            let _ = closed_tx.send(Arc::new(report));
        });

        Ok(id)
    }

    /// Receive a report for every tunnel closed from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TunnelReport>> {
        self.closed_tx.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot of per-adapter statistics
    #[must_use]
    pub fn adapter_snapshot(&self) -> HashMap<String, AdapterStatsSnapshot> {
        self.adapter_stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Number of running tunnels
    #[must_use]
    pub fn active_tunnels(&self) -> usize {
        self.active.len()
    }

    /// Running tunnel by id
    #[must_use]
    pub fn tunnel_info(&self, id: u64) -> Option<TunnelInfo> {
        self.active.get(&id).map(|entry| entry.value().clone())
    }

    /// Free admission slots; `None` when unlimited
    #[must_use]
    pub fn available_slots(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Check if the admission cap is exhausted
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.available_slots() == Some(0)
    }

    /// Initiate graceful shutdown
    ///
    /// Stops admitting tunnels, tells running ones to close and waits for
    /// them (up to the drain timeout).
    pub async fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        info!("Initiating tunnel manager shutdown");
        // No receivers when nothing runs
        let _ = self.shutdown_tx.send(());

        let drain_start = Instant::now();
        let check_interval = Duration::from_millis(50);

        while drain_start.elapsed() < self.drain_timeout {
            let active = self.active_tunnels();
            if active == 0 {
                info!("All tunnels drained");
                return;
            }
            debug!(
                "Waiting for {} tunnels to drain ({:.1}s remaining)",
                active,
                (self.drain_timeout.saturating_sub(drain_start.elapsed())).as_secs_f64()
            );
            tokio::time::sleep(check_interval).await;
        }

        let remaining = self.active_tunnels();
        if remaining > 0 {
            warn!("Drain timeout reached with {} tunnels still active", remaining);
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}
