//! Tunnel management module
//!
//! This module provides:
//! - Admission limiting with backpressure
//! - Tracking of running tunnels and close notifications
//! - Statistics collection
//! - Graceful shutdown

mod manager;
mod stats;

pub use manager::{TunnelInfo, TunnelManager};
pub use stats::{AdapterStats, AdapterStatsSnapshot, StatsSnapshot, TunnelStats};
