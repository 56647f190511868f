//! Tunnel statistics tracking
//!
//! Counters are updated from tunnel close notifications and read by the
//! binary when it logs final statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::tunnel::TunnelReport;

/// Atomic tunnel statistics
#[derive(Debug, Default)]
pub struct TunnelStats {
    /// Total tunnels admitted
    total_accepted: AtomicU64,
    /// Currently running tunnels
    active: AtomicU64,
    /// Tunnels that closed cleanly
    completed: AtomicU64,
    /// Tunnels that ended on an error
    errored: AtomicU64,
    /// Connections refused by the admission cap
    rejected: AtomicU64,
    /// Total bytes relayed client to remote
    bytes_up: AtomicU64,
    /// Total bytes relayed remote to client
    bytes_down: AtomicU64,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an admitted tunnel
    pub fn record_accepted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished tunnel
    pub fn record_closed(&self, report: &TunnelReport) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if report.is_error() {
            self.errored.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_up.fetch_add(report.bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(report.bytes_down, Ordering::Relaxed);
    }

    /// Record a connection refused by the admission cap
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_accepted: self.total_accepted(),
            active: self.active(),
            completed: self.completed(),
            errored: self.errored(),
            rejected: self.rejected(),
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default(),
        }
    }
}

/// Snapshot of tunnel statistics at a point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_accepted: u64,
    pub active: u64,
    pub completed: u64,
    pub errored: u64,
    pub rejected: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl StatsSnapshot {
    /// Get total bytes transferred (both directions)
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    /// Get success rate as a percentage (0-100)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.errored;
        if total == 0 {
            100.0
        } else {
            (self.completed as f64 / total as f64) * 100.0
        }
    }
}

/// Per-adapter statistics
#[derive(Debug, Default)]
pub struct AdapterStats {
    /// Tunnels routed to this adapter
    tunnels: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    /// Tunnels that ended on an error
    errors: AtomicU64,
}

impl AdapterStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished tunnel routed here
    pub fn record(&self, report: &TunnelReport) {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(report.bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(report.bytes_down, Ordering::Relaxed);
        if report.is_error() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            tunnels: self.tunnels.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of adapter statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStatsSnapshot {
    pub tunnels: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub errors: u64,
}
