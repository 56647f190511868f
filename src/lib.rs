//! policy-router: rule-based local proxy with fake-IP DNS
//!
//! This crate accepts SOCKS5 and HTTP proxy connections, decides per
//! connection which adapter carries it (direct, upstream HTTP/SOCKS5,
//! Shadowsocks, a speed race, or reject), and relays the bytes. A fake-IP DNS
//! server answers queries for proxied domains with synthetic addresses so the
//! domain can be recovered when the client connects to that address.
//!
//! # Features
//!
//! - **Ordered rules**: direct, all, country, domain list, IP range list and
//!   DNS-failure rules, evaluated in two phases for DNS and once per
//!   connection
//! - **Fake-IP DNS**: reusable address pool, upstream racing, reverse lookup
//! - **Adapters**: direct, HTTP CONNECT (optionally over TLS), SOCKS5,
//!   Shadowsocks, speed race, reject
//! - **Tunnel management**: admission cap, statistics, graceful shutdown
//! - **Virtual-interface UDP**: DNS interception and direct UDP forwarding
//!
//! # Architecture
//!
//! ```text
//! Client → ProxyListener → Tunnel(ProxySocket) → RuleManager → AdapterSocket → Destination
//!                              ↑                      ↑
//!                        SessionContext ←── DnsServerHandle (fake-IP reverse lookup)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use policy_router::adapter::AdapterRegistry;
//! use policy_router::config::load_config;
//! use policy_router::connection::TunnelManager;
//! use policy_router::proxy::{ProxyKind, ProxyListener};
//! use policy_router::rules::NoGeoIp;
//! use policy_router::session::SessionContext;
//! use policy_router::tunnel::TunnelContext;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/policy-router/config.json")?;
//!
//! let registry = AdapterRegistry::from_config(&config.adapters, &config.connection)?;
//! let rules = Arc::new(registry.build_rules(&config.rules, config.append_direct)?);
//! let ctx = TunnelContext::new(rules, SessionContext::new(Arc::new(NoGeoIp)));
//! let manager = Arc::new(TunnelManager::new(&config.connection, Arc::new(ctx)));
//!
//! let listener = ProxyListener::bind("127.0.0.1:1080".parse()?, ProxyKind::Socks5, manager)?;
//! let (_stop, stop_rx) = tokio::sync::broadcast::channel(1);
//! listener.run(stop_rx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`adapter`]: Remote-facing sockets and their factories
//! - [`config`]: Configuration types and loading
//! - [`connection`]: Tunnel manager and statistics
//! - [`error`]: Error types
//! - [`fakedns`]: Fake-IP DNS server
//! - [`ipstack`]: Virtual-interface UDP path
//! - [`proxy`]: Local-facing proxy sockets and listeners
//! - [`rules`]: Rule engine and GeoIP
//! - [`session`]: Connect sessions
//! - [`socket`]: Socket roles shared by proxies and adapters
//! - [`transport`]: Event-driven byte streams
//! - [`tunnel`]: Per-connection relay

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod adapter;
pub mod config;
pub mod connection;
pub mod error;
pub mod fakedns;
pub mod ipstack;
pub mod proxy;
pub mod rules;
pub mod session;
pub mod socket;
pub mod socks5_common;
pub mod transport;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use adapter::{AdapterFactory, AdapterRegistry};
pub use config::{Config, ListenConfig};
pub use connection::{StatsSnapshot, TunnelManager};
pub use error::{
    AdapterError, ConfigError, ConnectionError, PolicyRouterError, RuleError, SessionError, TransportError,
};
pub use fakedns::{DnsServer, DnsServerHandle};
pub use rules::{Rule, RuleManager};
pub use session::{ConnectSession, SessionContext};
pub use tunnel::{Tunnel, TunnelContext, TunnelReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
