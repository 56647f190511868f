//! Integration tests for policy-router
//!
//! These tests drive the public API end to end over loopback sockets.
//!
//! # Test Organization
//!
//! - `tunnel_e2e`: SOCKS5 and HTTP listeners relaying through real adapters
//! - `fakedns_roundtrip`: fake-IP answers recovered by tunnels and the UDP path
//! - `rule_scenarios`: configuration-driven routing decisions
//!
//! # Test Requirements
//!
//! - Everything binds to 127.0.0.1 with ephemeral ports
//! - No external network access is needed

pub mod fakedns_roundtrip;
pub mod rule_scenarios;
pub mod tunnel_e2e;
